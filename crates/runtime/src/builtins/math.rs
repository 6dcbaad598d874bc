//! Math builtins, thin wrappers over the host float functions.

use super::Args;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

fn numeric() -> Vec<TypeSpec> {
    vec![TypeSpec::OneOf(vec![
        TypeTag::Int,
        TypeTag::Float,
        TypeTag::Char,
    ])]
}

fn numeric2() -> Vec<TypeSpec> {
    let mut types = numeric();
    types.extend(numeric());
    types
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.math",
        vec![
            NamedFunction::new("acos", h_acos).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("asin", h_asin).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("atan", h_atan).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("atan2", h_atan2).with_arities(&[2]).with_types(numeric2()),
            NamedFunction::new("ceil", h_ceil).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("cos", h_cos).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("cosh", h_cosh).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("exp", h_exp).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("fabs", h_fabs).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("floor", h_floor).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("fmod", h_fmod).with_arities(&[2]).with_types(numeric2()),
            NamedFunction::new("log", h_log).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("log10", h_log10).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("pow", h_pow).with_arities(&[2]).with_types(numeric2()),
            NamedFunction::new("sin", h_sin).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("sinh", h_sinh).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("sqrt", h_sqrt).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("tan", h_tan).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("tanh", h_tanh).with_arities(&[1]).with_types(numeric()),
            NamedFunction::new("abs", h_abs).with_arities(&[1]).with_types(numeric()),
        ],
    );
}

macro_rules! float_fn {
    ($name:ident, $method:ident) => {
        fn $name(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
            let args = Args::new(frame);
            vm.track(ObjKind::Float(args.float(0).$method()))
        }
    };
}

float_fn!(h_acos, acos);
float_fn!(h_asin, asin);
float_fn!(h_atan, atan);
float_fn!(h_ceil, ceil);
float_fn!(h_cos, cos);
float_fn!(h_cosh, cosh);
float_fn!(h_exp, exp);
float_fn!(h_fabs, abs);
float_fn!(h_floor, floor);
float_fn!(h_log, ln);
float_fn!(h_log10, log10);
float_fn!(h_sin, sin);
float_fn!(h_sinh, sinh);
float_fn!(h_sqrt, sqrt);
float_fn!(h_tan, tan);
float_fn!(h_tanh, tanh);

fn h_atan2(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Float(args.float(0).atan2(args.float(1))))
}

fn h_fmod(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Float(args.float(0) % args.float(1)))
}

fn h_pow(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Float(args.float(0).powf(args.float(1))))
}

/// `abs` keeps integers integral, unlike `fabs`.
fn h_abs(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    match args.obj(0).map(|o| o.tag()) {
        Some(TypeTag::Float) => vm.track(ObjKind::Float(args.float(0).abs())),
        _ => vm.track(ObjKind::Int(args.int(0).abs())),
    }
}
