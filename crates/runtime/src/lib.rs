//! Hybris runtime: the value model, the mark-and-sweep collector, the
//! frame/scope manager, the tree-walking execution engine and the
//! module/builtin dispatch layer.
//!
//! The five subsystems compose bottom-up: the engine drives frames,
//! frames root the collector, the collector classifies objects by
//! survival, the value model defines what tracing a child means, and
//! module dispatch carries calls into host code. All interpreter state
//! hangs off an explicit [`vm::Vm`] handle; there is no process-global
//! VM.

pub mod builtins;
pub mod class;
pub mod engine;
pub mod error;
pub mod frame;
pub mod gc;
pub mod methods;
pub mod module;
pub mod ops;
pub mod regex;
pub mod serialize;
pub mod value;
pub mod vm;

pub use error::{ErrorKind, HybrisError};
pub use frame::{Frame, ScopePool, StateKind};
pub use gc::{Gc, GcConfig};
pub use module::{AritySpec, Module, NamedFunction, NativeFn, TypeSpec};
pub use value::{Obj, ObjKind, ObjRef, TypeTag};
pub use vm::{Vm, VmArgs, VERSION};
