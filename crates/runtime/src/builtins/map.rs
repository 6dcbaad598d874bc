//! Map builtins.

use super::Args;
use crate::error::HybrisError;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::ops;
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

fn map_first() -> Vec<TypeSpec> {
    vec![TypeSpec::OneOf(vec![TypeTag::Map])]
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.map",
        vec![
            NamedFunction::new("map", h_map),
            NamedFunction::new("mapelements", h_mapelements)
                .with_arities(&[1])
                .with_types(map_first()),
            NamedFunction::new("haskey", h_haskey)
                .with_arities(&[2])
                .with_types(map_first()),
            NamedFunction::new("mappop", h_mappop)
                .with_arities(&[1])
                .with_types(map_first()),
            NamedFunction::new("unmap", h_unmap)
                .with_arities(&[2])
                .with_types(map_first()),
            NamedFunction::new("keys", h_keys)
                .with_arities(&[1])
                .with_types(map_first()),
            NamedFunction::new("values", h_values)
                .with_arities(&[1])
                .with_types(map_first()),
        ],
    );
}

/// `map(k1, v1, k2, v2, …)` builds a map from its argument pairs.
fn h_map(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    if args.argc() % 2 != 0 {
        return vm.raise(
            frame,
            HybrisError::syntax("function 'map' requires an even number of arguments"),
        );
    }
    let map = vm.track(ObjKind::Map(Vec::new()));
    let mut i = 0;
    while i < args.argc() {
        let (Some(key), Some(value)) = (args.obj(i), args.obj(i + 1)) else {
            break;
        };
        if let Err(err) = ops::cl_set(&map, &key, &value) {
            return vm.raise(frame, err);
        }
        i += 2;
    }
    map
}

fn entries(o: &ObjRef) -> Vec<(ObjRef, ObjRef)> {
    match &*o.kind() {
        ObjKind::Map(entries) => entries.clone(),
        _ => Vec::new(),
    }
}

fn h_mapelements(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let count = args.obj(0).map(|o| entries(&o).len()).unwrap_or(0);
    vm.track(ObjKind::Int(count as i64))
}

fn h_haskey(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let (Some(map), Some(key)) = (args.obj(0), args.obj(1)) else {
        return vm.unit();
    };
    let found = entries(&map).iter().any(|(k, _)| ops::equals(k, &key));
    vm.track(ObjKind::Int(found as i64))
}

/// Remove and return the most recently inserted value.
fn h_mappop(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(map) = args.obj(0) else {
        return vm.unit();
    };
    let Some((key, _)) = entries(&map).last().cloned() else {
        return vm.raise(frame, HybrisError::index("pop from an empty map"));
    };
    match ops::cl_remove(&map, &key) {
        Ok(value) => value,
        Err(err) => vm.raise(frame, err),
    }
}

fn h_unmap(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let (Some(map), Some(key)) = (args.obj(0), args.obj(1)) else {
        return vm.unit();
    };
    match ops::cl_remove(&map, &key) {
        Ok(value) => value,
        Err(err) => vm.raise(frame, err),
    }
}

fn h_keys(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let keys = args
        .obj(0)
        .map(|m| entries(&m).iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default();
    vm.track(ObjKind::Vector(keys))
}

fn h_values(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let values = args
        .obj(0)
        .map(|m| entries(&m).iter().map(|(_, v)| v.clone()).collect())
        .unwrap_or_default();
    vm.track(ObjKind::Vector(values))
}
