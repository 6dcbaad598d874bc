//! File I/O builtins. Open files are carried through script code as
//! opaque handle values keyed into the VM's handle table.

use super::Args;
use crate::error::HybrisError;
use crate::frame::Frame;
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

fn handle_first() -> Vec<TypeSpec> {
    vec![TypeSpec::OneOf(vec![TypeTag::Handle])]
}

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.io.file",
        vec![
            NamedFunction::new("fopen", h_fopen)
                .with_arities(&[2])
                .with_types(vec![
                    TypeSpec::OneOf(vec![TypeTag::Str]),
                    TypeSpec::OneOf(vec![TypeTag::Str]),
                ]),
            NamedFunction::new("fclose", h_fclose)
                .with_arities(&[1])
                .with_types(handle_first()),
            NamedFunction::new("fread", h_fread)
                .with_arities(&[2])
                .with_types(handle_first()),
            NamedFunction::new("fgets", h_fgets)
                .with_arities(&[1])
                .with_types(handle_first()),
            NamedFunction::new("fwrite", h_fwrite)
                .with_arities(&[2])
                .with_types(handle_first()),
            NamedFunction::new("fseek", h_fseek)
                .with_arities(&[2])
                .with_types(handle_first()),
            NamedFunction::new("ftell", h_ftell)
                .with_arities(&[1])
                .with_types(handle_first()),
            NamedFunction::new("fsize", h_fsize).with_arities(&[1]),
            NamedFunction::new("file", h_file)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Str])]),
            NamedFunction::new("readdir", h_readdir)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Str])]),
        ],
    );
}

fn io_error(frame_fn: &str, e: std::io::Error) -> HybrisError {
    HybrisError::runtime(format!("{}: {}", frame_fn, e))
}

fn h_fopen(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let path = args.string(0);
    let mode = args.string(1);

    let mut options = std::fs::OpenOptions::new();
    match mode.as_str() {
        "r" => options.read(true),
        "r+" => options.read(true).write(true),
        "w" => options.write(true).create(true).truncate(true),
        "w+" => options.read(true).write(true).create(true).truncate(true),
        "a" => options.append(true).create(true),
        "a+" => options.read(true).append(true).create(true),
        other => {
            return vm.raise(
                frame,
                HybrisError::runtime(format!("fopen: invalid mode '{}'", other)),
            );
        }
    };

    match options.open(&path) {
        Ok(file) => {
            let id = vm.next_handle_id();
            vm.handles().insert(id, file);
            vm.track(ObjKind::Handle(id))
        }
        Err(e) => vm.raise(frame, io_error("fopen", e)),
    }
}

fn handle_id(args: &Args<'_>) -> Option<u64> {
    args.obj(0).and_then(|o| match &*o.kind() {
        ObjKind::Handle(id) => Some(*id),
        _ => None,
    })
}

fn h_fclose(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(id) = handle_id(&args) else {
        return vm.unit();
    };
    if vm.handles().remove(&id).is_none() {
        return vm.raise(frame, HybrisError::runtime("fclose: stale file handle"));
    }
    vm.unit()
}

fn h_fread(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(id) = handle_id(&args) else {
        return vm.unit();
    };
    let size = args.int(1).max(0) as usize;
    let mut buffer = vec![0u8; size];
    let read = {
        let mut handles = vm.handles();
        let Some(file) = handles.get_mut(&id) else {
            return vm.raise(frame, HybrisError::runtime("fread: stale file handle"));
        };
        match file.read(&mut buffer) {
            Ok(read) => read,
            Err(e) => {
                drop(handles);
                return vm.raise(frame, io_error("fread", e));
            }
        }
    };
    buffer.truncate(read);
    vm.track(ObjKind::Binary(buffer))
}

/// Read up to and including the next newline; the newline is stripped.
fn h_fgets(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(id) = handle_id(&args) else {
        return vm.unit();
    };
    let mut line = Vec::new();
    {
        let mut handles = vm.handles();
        let Some(file) = handles.get_mut(&id) else {
            return vm.raise(frame, HybrisError::runtime("fgets: stale file handle"));
        };
        let mut byte = [0u8; 1];
        loop {
            match file.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(e) => {
                    drop(handles);
                    return vm.raise(frame, io_error("fgets", e));
                }
            }
        }
    }
    if line.ends_with(b"\r") {
        line.pop();
    }
    vm.track(ObjKind::Str(String::from_utf8_lossy(&line).into_owned()))
}

fn h_fwrite(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(id) = handle_id(&args) else {
        return vm.unit();
    };
    let bytes = args.bytes(1);
    let written = {
        let mut handles = vm.handles();
        let Some(file) = handles.get_mut(&id) else {
            return vm.raise(frame, HybrisError::runtime("fwrite: stale file handle"));
        };
        match file.write(&bytes) {
            Ok(written) => written,
            Err(e) => {
                drop(handles);
                return vm.raise(frame, io_error("fwrite", e));
            }
        }
    };
    vm.track(ObjKind::Int(written as i64))
}

fn h_fseek(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(id) = handle_id(&args) else {
        return vm.unit();
    };
    let position = args.int(1).max(0) as u64;
    let mut handles = vm.handles();
    let Some(file) = handles.get_mut(&id) else {
        return vm.raise(frame, HybrisError::runtime("fseek: stale file handle"));
    };
    match file.seek(SeekFrom::Start(position)) {
        Ok(new_position) => {
            drop(handles);
            vm.track(ObjKind::Int(new_position as i64))
        }
        Err(e) => {
            drop(handles);
            vm.raise(frame, io_error("fseek", e))
        }
    }
}

fn h_ftell(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let Some(id) = handle_id(&args) else {
        return vm.unit();
    };
    let mut handles = vm.handles();
    let Some(file) = handles.get_mut(&id) else {
        return vm.raise(frame, HybrisError::runtime("ftell: stale file handle"));
    };
    match file.stream_position() {
        Ok(position) => {
            drop(handles);
            vm.track(ObjKind::Int(position as i64))
        }
        Err(e) => {
            drop(handles);
            vm.raise(frame, io_error("ftell", e))
        }
    }
}

/// Size of an open handle or of a path.
fn h_fsize(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    if let Some(id) = handle_id(&args) {
        let size = {
            let handles = vm.handles();
            handles.get(&id).and_then(|f| f.metadata().ok()).map(|m| m.len())
        };
        return match size {
            Some(size) => vm.track(ObjKind::Int(size as i64)),
            None => vm.raise(frame, HybrisError::runtime("fsize: stale file handle")),
        };
    }
    let path = args.string(0);
    match std::fs::metadata(&path) {
        Ok(meta) => vm.track(ObjKind::Int(meta.len() as i64)),
        Err(e) => vm.raise(frame, io_error("fsize", e)),
    }
}

/// Slurp a whole file as a string.
fn h_file(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let path = args.string(0);
    match std::fs::read_to_string(&path) {
        Ok(content) => vm.track(ObjKind::Str(content)),
        Err(e) => vm.raise(frame, io_error("file", e)),
    }
}

fn h_readdir(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let path = args.string(0);
    match std::fs::read_dir(&path) {
        Ok(entries) => {
            let mut names = Vec::new();
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().into_owned();
                names.push(vm.track(ObjKind::Str(name)));
            }
            vm.track(ObjKind::Vector(names))
        }
        Err(e) => vm.raise(frame, io_error("readdir", e)),
    }
}
