//! Process builtins.

use super::Args;
use crate::error::HybrisError;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.process",
        vec![
            NamedFunction::new("exit", h_exit).with_arities(&[0, 1]),
            NamedFunction::new("getpid", h_getpid).with_arities(&[0]),
            NamedFunction::new("exec", h_exec)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Str])]),
        ],
    );
}

fn h_exit(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let code = args.int(0) as i32;
    vm.release();
    std::process::exit(code);
}

fn h_getpid(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    vm.track(ObjKind::Int(std::process::id() as i64))
}

/// Run a shell command and yield its standard output.
fn h_exec(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let command = args.string(0);
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(&command)
        .output();
    match output {
        Ok(output) => vm.track(ObjKind::Str(
            String::from_utf8_lossy(&output.stdout).into_owned(),
        )),
        Err(e) => vm.raise(
            frame,
            HybrisError::runtime(format!("could not execute '{}': {}", command, e)),
        ),
    }
}
