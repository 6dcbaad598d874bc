//! Vector builtins.

use super::Args;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::ops;
use crate::value::{self, ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

fn vector_first() -> Vec<TypeSpec> {
    vec![TypeSpec::OneOf(vec![TypeTag::Vector])]
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.array",
        vec![
            NamedFunction::new("array", h_array),
            NamedFunction::new("elements", h_elements)
                .with_arities(&[1])
                .with_types(vector_first()),
            NamedFunction::new("pop", h_pop)
                .with_arities(&[1])
                .with_types(vector_first()),
            NamedFunction::new("remove", h_remove)
                .with_arities(&[2])
                .with_types(vector_first()),
            NamedFunction::new("contains", h_contains)
                .with_arities(&[2])
                .with_types(vector_first()),
            NamedFunction::new("join", h_join)
                .with_arities(&[2])
                .with_types(vector_first()),
        ],
    );
}

fn h_array(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Vector(args.rest(0)))
}

fn h_elements(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let size = args.obj(0).map(|o| value::get_size(&o)).unwrap_or(0);
    vm.track(ObjKind::Int(size as i64))
}

fn h_pop(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(vector) = args.obj(0) else {
        return vm.unit();
    };
    match ops::cl_pop(&vector) {
        Ok(value) => value,
        Err(err) => vm.raise(frame, err),
    }
}

fn h_remove(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let (Some(vector), Some(target)) = (args.obj(0), args.obj(1)) else {
        return vm.unit();
    };
    match ops::cl_remove(&vector, &target) {
        Ok(value) => value,
        Err(err) => vm.raise(frame, err),
    }
}

fn h_contains(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let (Some(vector), Some(target)) = (args.obj(0), args.obj(1)) else {
        return vm.unit();
    };
    match ops::cl_contains(vm, &vector, &target) {
        Ok(value) => value,
        Err(err) => vm.raise(frame, err),
    }
}

fn h_join(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(vector) = args.obj(0) else {
        return vm.unit();
    };
    let glue = args.string(1);
    let items = match &*vector.kind() {
        ObjKind::Vector(items) => items.clone(),
        _ => Vec::new(),
    };
    let parts: Vec<String> = items.iter().map(value::svalue).collect();
    vm.track(ObjKind::Str(parts.join(&glue)))
}
