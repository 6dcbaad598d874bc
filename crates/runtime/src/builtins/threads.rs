//! Worker thread builtins.
//!
//! `pthread_create` spawns an OS thread running a named user function
//! or an alias. To keep the new thread from running before its scope
//! exists, the parent holds the scope mutex across both the host spawn
//! and the scope registration; the worker's first action is to acquire
//! and release that same mutex. The worker's root frame is seeded by
//! the parent under the same lock, so the argument values are rooted
//! before the parent's builtin frame goes away.

use super::Args;
use crate::engine;
use crate::error::HybrisError;
use crate::frame::{Frame, StateKind};
use crate::module::{self, NamedFunction, TypeSpec};
use crate::value::{self, ObjKind, ObjRef, TypeTag};
use crate::vm::Vm;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub fn register(vm: &Vm) {
    module::register_builtin(
        vm,
        "std.os.threads",
        vec![
            NamedFunction::new("pthread_create", h_pthread_create).with_types(vec![
                TypeSpec::OneOf(vec![TypeTag::Str, TypeTag::Alias]),
            ]),
            NamedFunction::new("pthread_join", h_pthread_join)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Int])]),
            NamedFunction::new("pthread_exit", h_pthread_exit).with_arities(&[0]),
            NamedFunction::new("pthread_kill", h_pthread_kill)
                .with_arities(&[1])
                .with_types(vec![TypeSpec::OneOf(vec![TypeTag::Int])]),
        ],
    );
}

fn h_pthread_create(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    if args.argc() == 0 {
        return vm.raise(
            frame,
            HybrisError::syntax("function 'pthread_create' requires at least 1 argument"),
        );
    }
    let Some(target) = args.obj(0) else {
        return vm.unit();
    };
    let argv = args.rest(1);

    // resolve to a function name up front so a bad target fails in the
    // caller, not in the worker
    let name = match &*target.kind() {
        ObjKind::Str(s) => s.clone(),
        ObjKind::Alias(index) => match vm.function_by_index(*index) {
            Some((name, _)) => name,
            None => {
                return vm.raise(frame, HybrisError::name("stale function alias"));
            }
        },
        _ => {
            return vm.raise(
                frame,
                HybrisError::type_error("pthread_create requires a function name or alias"),
            );
        }
    };
    if vm.function_node(&name).is_none() {
        return vm.raise(
            frame,
            HybrisError::name(format!("'{}' undeclared user function identifier", name)),
        );
    }

    let id = vm.next_thread_id();
    let kill = Arc::new(AtomicBool::new(false));
    let root = Frame::new(format!("<thread {}>", id));
    for arg in &argv {
        root.push_tmp(arg.clone());
    }

    let worker_vm = vm.clone();
    let worker_root = root.clone();
    let worker_name = name.clone();
    let worker_argv = argv.clone();

    // rendez-vous: the scope mutex is held across spawn + registration
    let handle = {
        let mut scopes = vm.scopes();
        let handle = std::thread::spawn(move || {
            // wait for the parent to finish registering this scope
            drop(worker_vm.scopes());
            run_worker(&worker_vm, &worker_root, &worker_name, &worker_argv);
        });
        scopes.register_thread(handle.thread().id(), kill);
        scopes.push_frame_for(handle.thread().id(), root);
        handle
    };

    vm.threads().insert(id, handle);
    vm.track(ObjKind::Int(id as i64))
}

fn run_worker(vm: &Arc<Vm>, root: &Frame, name: &str, argv: &[ObjRef]) {
    let function = vm.function_node(name);
    if let Some(node) = function {
        engine::call_user_values(vm, root, name, &node, argv);
    }

    if root.is_state(StateKind::Exception) {
        let rendered = root
            .state_value()
            .map(|v| value::svalue(&v))
            .unwrap_or_default();
        eprintln!(
            "\x1b[22;31mERROR : Unhandled exception in {} : {} .\x1b[00m",
            root.owner(),
            rendered
        );
    }

    vm.scopes().deregister_thread(std::thread::current().id());
}

fn h_pthread_join(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let id = args.int(0) as u64;
    let Some(handle) = vm.threads().remove(&id) else {
        return vm.raise(
            frame,
            HybrisError::runtime(format!("pthread_join: unknown thread {}", id)),
        );
    };
    let _ = handle.join();
    vm.unit()
}

/// Ends the calling worker at its next statement boundary by leaving a
/// return state on every frame of its scope.
fn h_pthread_exit(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    frame.set_state(StateKind::Return, Some(vm.unit()));
    for scope_frame in vm.scopes().current_frames() {
        scope_frame.set_state(StateKind::Return, Some(vm.unit()));
    }
    vm.unit()
}

/// Cooperative kill: raises the target's kill flag, observed at its
/// next statement boundary.
fn h_pthread_kill(vm: &Arc<Vm>, frame: &Frame) -> ObjRef {
    let args = Args::new(frame);
    let id = args.int(0) as u64;
    let tid = {
        let threads = vm.threads();
        threads.get(&id).map(|handle| handle.thread().id())
    };
    let Some(tid) = tid else {
        return vm.raise(
            frame,
            HybrisError::runtime(format!("pthread_kill: unknown thread {}", id)),
        );
    };
    if let Some(flag) = vm.scopes().kill_flag(tid) {
        flag.store(true, Ordering::SeqCst);
    }
    vm.unit()
}
