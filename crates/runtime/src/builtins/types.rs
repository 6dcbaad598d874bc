//! Type reflection and conversion builtins.

use super::Args;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::serialize;
use crate::value::{self, ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.type",
        vec![
            NamedFunction::new("typeof", h_typeof).with_arities(&[1]),
            NamedFunction::new("sizeof", h_sizeof).with_arities(&[1]),
            NamedFunction::new("toint", h_toint).with_arities(&[1]),
            NamedFunction::new("tostring", h_tostring).with_arities(&[1]),
            NamedFunction::new("isint", h_isint).with_arities(&[1]),
            NamedFunction::new("isfloat", h_isfloat).with_arities(&[1]),
            NamedFunction::new("ischar", h_ischar).with_arities(&[1]),
            NamedFunction::new("isstring", h_isstring).with_arities(&[1]),
            NamedFunction::new("isarray", h_isarray).with_arities(&[1]),
            NamedFunction::new("ismap", h_ismap).with_arities(&[1]),
            NamedFunction::new("isalias", h_isalias).with_arities(&[1]),
            NamedFunction::new("serialize", h_serialize).with_arities(&[1]),
            NamedFunction::new("deserialize", h_deserialize)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Binary])]),
        ],
    );
}

fn h_typeof(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    match args.obj(0) {
        Some(o) => vm.track(ObjKind::Str(o.type_name().to_string())),
        None => vm.unit(),
    }
}

fn h_sizeof(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    match args.obj(0) {
        Some(o) => vm.track(ObjKind::Int(value::get_size(&o) as i64)),
        None => vm.unit(),
    }
}

fn h_toint(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(o) = args.obj(0) else {
        return vm.unit();
    };
    match value::to_int(&o) {
        Ok(v) => vm.track(ObjKind::Int(v)),
        Err(err) => vm.raise(frame, err),
    }
}

fn h_tostring(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Str(args.string(0)))
}

fn type_check(vm: &Arc<Vm>, frame: &Frame, tag: TypeTag) -> ObjRef {
    let args = Args::new(frame);
    let matches = args.obj(0).map(|o| o.tag() == tag).unwrap_or(false);
    vm.track(ObjKind::Int(matches as i64))
}

fn h_isint(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    type_check(vm, frame, TypeTag::Int)
}

fn h_isfloat(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    type_check(vm, frame, TypeTag::Float)
}

fn h_ischar(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    type_check(vm, frame, TypeTag::Char)
}

fn h_isstring(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    type_check(vm, frame, TypeTag::Str)
}

fn h_isarray(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    type_check(vm, frame, TypeTag::Vector)
}

fn h_ismap(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    type_check(vm, frame, TypeTag::Map)
}

fn h_isalias(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    type_check(vm, frame, TypeTag::Alias)
}

fn h_serialize(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(o) = args.obj(0) else {
        return vm.unit();
    };
    match serialize::serialize(&o) {
        Ok(bytes) => vm.track(ObjKind::Binary(bytes)),
        Err(err) => vm.raise(frame, err),
    }
}

fn h_deserialize(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let bytes = args.bytes(0);
    match serialize::deserialize(vm, &bytes) {
        Ok(o) => o,
        Err(err) => vm.raise(frame, err),
    }
}
