//! Collector introspection builtins.

use super::Args;
use crate::frame::Frame;
use crate::gc;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

fn int_first() -> Vec<TypeSpec> {
    vec![TypeSpec::OneOf(vec![TypeTag::Int])]
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.gc",
        vec![
            NamedFunction::new("gc_collect", h_gc_collect).with_arities(&[0]),
            NamedFunction::new("gc_mm_usage", h_gc_mm_usage).with_arities(&[0]),
            NamedFunction::new("gc_mm_items", h_gc_mm_items).with_arities(&[0]),
            NamedFunction::new("gc_collect_threshold", h_gc_collect_threshold).with_arities(&[0]),
            NamedFunction::new("gc_mm_threshold", h_gc_mm_threshold).with_arities(&[0]),
            NamedFunction::new("gc_set_collect_threshold", h_gc_set_collect_threshold)
                .with_arities(&[1])
                .with_types(int_first()),
            NamedFunction::new("gc_set_mm_threshold", h_gc_set_mm_threshold)
                .with_arities(&[1])
                .with_types(int_first()),
        ],
    );
}

fn h_gc_collect(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    gc::collect_now(vm);
    vm.unit()
}

fn h_gc_mm_usage(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    let usage = vm.gc().usage();
    vm.track(ObjKind::Int(usage as i64))
}

fn h_gc_mm_items(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    let items = vm.gc().items();
    vm.track(ObjKind::Int(items as i64))
}

fn h_gc_collect_threshold(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    let threshold = vm.gc().collect_threshold();
    vm.track(ObjKind::Int(threshold as i64))
}

fn h_gc_mm_threshold(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    let threshold = vm.gc().mm_threshold();
    vm.track(ObjKind::Int(threshold as i64))
}

fn h_gc_set_collect_threshold(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let old = vm.gc().set_collect_threshold(args.int(0).max(0) as usize);
    vm.track(ObjKind::Int(old as i64))
}

fn h_gc_set_mm_threshold(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let old = vm.gc().set_mm_threshold(args.int(0).max(0) as usize);
    vm.track(ObjKind::Int(old as i64))
}
