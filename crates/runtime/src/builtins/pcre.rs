//! Regular expression builtins, backed by the VM's compiled-pattern
//! cache.

use super::Args;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::regex;
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

fn two_strings() -> Vec<TypeSpec> {
    vec![
        TypeSpec::OneOf(vec![TypeTag::Str]),
        TypeSpec::OneOf(vec![TypeTag::Str]),
    ]
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.regex",
        vec![
            NamedFunction::new("rex_match", h_rex_match)
                .with_arities(&[2])
                .with_types(two_strings()),
            NamedFunction::new("rex_matches", h_rex_matches)
                .with_arities(&[2])
                .with_types(two_strings()),
            NamedFunction::new("rex_replace", h_rex_replace)
                .with_arities(&[3])
                .with_types(vec![
                    TypeSpec::OneOf(vec![TypeTag::Str]),
                    TypeSpec::OneOf(vec![TypeTag::Str]),
                    TypeSpec::OneOf(vec![TypeTag::Str]),
                ]),
        ],
    );
}

fn h_rex_match(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let subject = args.string(0);
    let pattern = args.string(1);
    match regex::compile(vm, &pattern) {
        Ok(re) => vm.track(ObjKind::Int(re.is_match(&subject) as i64)),
        Err(err) => vm.raise(frame, err),
    }
}

/// All matched substrings (whole-match, not captures).
fn h_rex_matches(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let subject = args.string(0);
    let pattern = args.string(1);
    match regex::compile(vm, &pattern) {
        Ok(re) => {
            let matches: Vec<ObjRef> = re
                .find_iter(&subject)
                .map(|m| vm.track(ObjKind::Str(m.as_str().to_string())))
                .collect();
            vm.track(ObjKind::Vector(matches))
        }
        Err(err) => vm.raise(frame, err),
    }
}

fn h_rex_replace(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let subject = args.string(0);
    let pattern = args.string(1);
    let replacement = args.string(2);
    match regex::compile(vm, &pattern) {
        Ok(re) => vm.track(ObjKind::Str(
            re.replace_all(&subject, replacement.as_str()).into_owned(),
        )),
        Err(err) => vm.raise(frame, err),
    }
}
