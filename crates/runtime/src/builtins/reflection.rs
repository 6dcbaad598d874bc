//! Reflection builtins: dynamic calls and introspection over the VM's
//! segments.

use super::Args;
use crate::engine;
use crate::error::HybrisError;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.reflection",
        vec![
            NamedFunction::new("call", h_call).with_types(vec![TypeSpec::OneOf(vec![
                TypeTag::Str,
                TypeTag::Alias,
            ])]),
            NamedFunction::new("var_names", h_var_names).with_arities(&[0]),
            NamedFunction::new("user_functions", h_user_functions).with_arities(&[0]),
            NamedFunction::new("dyn_functions", h_dyn_functions).with_arities(&[0]),
        ],
    );
}

/// `call(name_or_alias, args…)`: invoke a function chosen at run time.
fn h_call(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    if args.argc() == 0 {
        return vm.raise(
            frame,
            HybrisError::syntax("function 'call' requires at least 1 argument"),
        );
    }
    let argv = args.rest(1);
    let Some(target) = args.obj(0) else {
        return vm.unit();
    };

    let alias = match &*target.kind() {
        ObjKind::Alias(index) => Some(*index),
        _ => None,
    };
    if let Some(index) = alias {
        if let Some((name, node)) = vm.function_by_index(index) {
            return engine::call_user_values(vm, frame, &name, &node, &argv);
        }
        return vm.raise(frame, HybrisError::name("stale function alias"));
    }

    let name = args.string(0);
    engine::call_function_by_name(vm, frame, &name, &argv)
}

/// Names bound in the global frame.
fn h_var_names(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    let main = vm.main_frame();
    let mut names = Vec::new();
    for i in 0..main.size() {
        if let Some(label) = main.label(i) {
            if !label.is_empty() {
                names.push(vm.track(ObjKind::Str(label)));
            }
        }
    }
    vm.track(ObjKind::Vector(names))
}

fn h_user_functions(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    let names = vm
        .user_function_names()
        .into_iter()
        .map(|name| vm.track(ObjKind::Str(name)))
        .collect();
    vm.track(ObjKind::Vector(names))
}

/// Map of module name to the functions it exports.
fn h_dyn_functions(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    let modules: Vec<_> = vm.modules().clone();
    let mut entries = Vec::new();
    for module in modules {
        let functions: Vec<ObjRef> = module
            .functions
            .iter()
            .map(|f| vm.track(ObjKind::Str(f.identifier.clone())))
            .collect();
        entries.push((
            vm.track(ObjKind::Str(module.name.clone())),
            vm.track(ObjKind::Vector(functions)),
        ));
    }
    vm.track(ObjKind::Map(entries))
}
