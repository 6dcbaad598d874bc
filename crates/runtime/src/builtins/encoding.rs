//! Encoding builtins: base64 and hex.

use super::Args;
use crate::error::HybrisError;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use std::sync::Arc;

fn text_or_bytes() -> Vec<TypeSpec> {
    vec![TypeSpec::OneOf(vec![TypeTag::Str, TypeTag::Binary])]
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.encoding",
        vec![
            NamedFunction::new("base64encode", h_base64encode)
                .with_arities(&[1])
                .with_types(text_or_bytes()),
            NamedFunction::new("base64decode", h_base64decode)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Str])]),
            NamedFunction::new("hexencode", h_hexencode)
                .with_arities(&[1])
                .with_types(text_or_bytes()),
            NamedFunction::new("hexdecode", h_hexdecode)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Str])]),
        ],
    );
}

fn h_base64encode(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Str(BASE64.encode(args.bytes(0))))
}

fn h_base64decode(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    match BASE64.decode(args.string(0)) {
        Ok(bytes) => vm.track(ObjKind::Binary(bytes)),
        Err(e) => vm.raise(
            frame,
            HybrisError::runtime(format!("invalid base64 input: {}", e)),
        ),
    }
}

fn h_hexencode(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    vm.track(ObjKind::Str(hex::encode(args.bytes(0))))
}

fn h_hexdecode(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    match hex::decode(args.string(0)) {
        Ok(bytes) => vm.track(ObjKind::Binary(bytes)),
        Err(e) => vm.raise(
            frame,
            HybrisError::runtime(format!("invalid hex input: {}", e)),
        ),
    }
}
