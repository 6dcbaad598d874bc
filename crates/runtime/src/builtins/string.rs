//! String builtins.

use super::Args;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

fn string_first() -> Vec<TypeSpec> {
    vec![TypeSpec::OneOf(vec![TypeTag::Str])]
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.string",
        vec![
            NamedFunction::new("strlen", h_strlen)
                .with_arities(&[1])
                .with_types(string_first()),
            NamedFunction::new("strfind", h_strfind)
                .with_arities(&[2])
                .with_types(vec![
                    TypeSpec::OneOf(vec![TypeTag::Str]),
                    TypeSpec::OneOf(vec![TypeTag::Str, TypeTag::Char]),
                ]),
            NamedFunction::new("substr", h_substr)
                .with_arities(&[2, 3])
                .with_types(string_first()),
            NamedFunction::new("strreplace", h_strreplace)
                .with_arities(&[3])
                .with_types(string_first()),
            NamedFunction::new("strsplit", h_strsplit)
                .with_arities(&[2])
                .with_types(string_first()),
            NamedFunction::new("trim", h_trim)
                .with_arities(&[1])
                .with_types(string_first()),
            NamedFunction::new("toupper", h_toupper)
                .with_arities(&[1])
                .with_types(string_first()),
            NamedFunction::new("tolower", h_tolower)
                .with_arities(&[1])
                .with_types(string_first()),
        ],
    );
}

fn h_strlen(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Int(args.string(0).len() as i64))
}

/// Character position of the first occurrence, or false when absent.
fn h_strfind(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let haystack = args.string(0);
    let needle = args.string(1);
    let position = haystack
        .find(&needle)
        .map(|byte| haystack[..byte].chars().count() as i64)
        .unwrap_or(-1);
    vm.track(ObjKind::Int(position))
}

/// `substr(s, start [, length])`, character-indexed.
fn h_substr(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let text = args.string(0);
    let chars: Vec<char> = text.chars().collect();
    let start = args.int(1).max(0) as usize;
    let length = if args.argc() > 2 {
        args.int(2).max(0) as usize
    } else {
        chars.len().saturating_sub(start)
    };
    let piece: String = chars.iter().skip(start).take(length).collect();
    vm.track(ObjKind::Str(piece))
}

fn h_strreplace(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let text = args.string(0);
    let from = args.string(1);
    let to = args.string(2);
    vm.track(ObjKind::Str(text.replace(&from, &to)))
}

fn h_strsplit(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let text = args.string(0);
    let separator = args.string(1);
    let parts: Vec<ObjRef> = text
        .split(&separator)
        .map(|part| vm.track(ObjKind::Str(part.to_string())))
        .collect();
    vm.track(ObjKind::Vector(parts))
}

fn h_trim(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Str(args.string(0).trim().to_string()))
}

fn h_toupper(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Str(args.string(0).to_uppercase()))
}

fn h_tolower(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Str(args.string(0).to_lowercase()))
}
