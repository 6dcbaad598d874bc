//! Console I/O builtins: `print`, `println`, `input`.

use super::Args;
use crate::frame::Frame;
use crate::module::{self, NamedFunction};
use crate::value::{ObjKind, ObjRef};
use crate::vm::Vm;
use std::io::BufRead;
use std::sync::Arc;

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.io.console",
        vec![
            NamedFunction::new("print", h_print),
            NamedFunction::new("println", h_println),
            NamedFunction::new("input", h_input).with_arities(&[0]),
        ],
    );
}

fn h_print(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let mut out = String::new();
    for i in 0..args.argc() {
        out.push_str(&args.string(i));
    }
    vm.write_out(&out);
    vm.unit()
}

fn h_println(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let mut out = String::new();
    for i in 0..args.argc() {
        out.push_str(&args.string(i));
    }
    out.push('\n');
    vm.write_out(&out);
    vm.unit()
}

fn h_input(vm: &Arc<Vm>, _frame: &Frame) -> ObjRef {
    let mut line = String::new();
    let stdin = std::io::stdin();
    let _ = stdin.lock().read_line(&mut line);
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    vm.track(ObjKind::Str(line))
}
