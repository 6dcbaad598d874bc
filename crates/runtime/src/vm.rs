//! The virtual machine.
//!
//! All interpreter state lives here and is passed explicitly to every
//! public entry point — there is no process-global VM. The five fixed
//! mutexes are declared in their acquisition order; code that needs
//! more than one takes them in this order:
//!
//!   1. GC mutex (object lists, usage counters)
//!   2. scope mutex (thread-keyed scope map, frame lists)
//!   3. lookup-cache mutex (native function cache)
//!   4. regex-cache mutex (compiled patterns)
//!   5. line mutex (current line for diagnostics)

use crate::error::{ErrorKind, HybrisError};
use crate::frame::{Frame, ScopePool, StateKind};
use crate::gc::{Gc, GcConfig};
use crate::module::{Module, NamedFunction};
use crate::value::{self, ObjKind, ObjRef};
use hybris_parser::ast::{Literal, Node};
use ::regex::Regex;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_LIB_PATH: &str = "/usr/lib/hybris/library/";
pub const DEFAULT_INC_PATH: &str = "/usr/lib/hybris/include/";

/// Interpreter launch parameters, as shaped by the CLI surface.
#[derive(Debug, Default, Clone)]
pub struct VmArgs {
    pub source: Option<PathBuf>,
    pub script_args: Vec<String>,
    pub timing: bool,
    pub stacktrace: bool,
    pub gc_threshold: Option<usize>,
    pub mm_threshold: Option<usize>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Vm {
    pub args: VmArgs,

    // the five fixed mutexes, in acquisition order
    gc: Mutex<Gc>,
    scopes: Mutex<ScopePool>,
    mcache: Mutex<HashMap<String, Arc<NamedFunction>>>,
    pcre_cache: Mutex<HashMap<String, Arc<Regex>>>,
    lineno: Mutex<usize>,

    // segments
    vconst: Mutex<Vec<(String, ObjRef)>>,
    vcode: Mutex<Vec<(String, Arc<Node>)>>,
    vtypes: Mutex<Vec<(String, ObjRef)>>,
    modules: Mutex<Vec<Arc<Module>>>,

    // literal nodes intern their value on first evaluation
    node_consts: Mutex<HashMap<usize, ObjRef>>,

    // native handle and worker-thread tables
    handles: Mutex<HashMap<u64, std::fs::File>>,
    next_handle: AtomicU64,
    threads: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_thread: AtomicU64,

    main_frame: Frame,
    unit: ObjRef,
    lib_path: String,
    inc_path: String,
    output: Mutex<Box<dyn Write + Send>>,
}

impl Vm {
    pub fn new(args: VmArgs) -> Arc<Vm> {
        Self::with_output(args, Box::new(std::io::stdout()))
    }

    /// Build a VM writing script output to the given sink. Must be
    /// called on the thread that will act as the interpreter's main
    /// thread.
    pub fn with_output(args: VmArgs, output: Box<dyn Write + Send>) -> Arc<Vm> {
        let mut config = GcConfig::default();
        if let Some(threshold) = args.gc_threshold {
            config.collect_threshold = threshold;
        }
        if let Some(threshold) = args.mm_threshold {
            config.mm_threshold = threshold;
        }

        let mut gc = Gc::new(config);
        let unit = gc
            .track(ObjKind::Int(0))
            .expect("fresh collector cannot be over its memory cap");
        unit.set_constant();

        let main_frame = Frame::new("<main>");
        let lib_path =
            std::env::var("HYBRIS_LIB_PATH").unwrap_or_else(|_| DEFAULT_LIB_PATH.to_string());
        let inc_path =
            std::env::var("HYBRIS_INC_PATH").unwrap_or_else(|_| DEFAULT_INC_PATH.to_string());

        let vm = Arc::new(Vm {
            gc: Mutex::new(gc),
            scopes: Mutex::new(ScopePool::new(main_frame.clone())),
            mcache: Mutex::new(HashMap::new()),
            pcre_cache: Mutex::new(HashMap::new()),
            lineno: Mutex::new(0),
            vconst: Mutex::new(Vec::new()),
            vcode: Mutex::new(Vec::new()),
            vtypes: Mutex::new(Vec::new()),
            modules: Mutex::new(Vec::new()),
            node_consts: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            threads: Mutex::new(HashMap::new()),
            next_thread: AtomicU64::new(1),
            main_frame,
            unit,
            lib_path,
            inc_path,
            output: Mutex::new(output),
            args,
        });

        vm.init_constants();
        crate::builtins::register_all(&vm);
        vm
    }

    fn init_constants(&self) {
        self.define_constant("true", ObjKind::Int(1));
        self.define_constant("false", ObjKind::Int(0));
        self.define_constant("null", ObjKind::Reference(None));
        self.define_constant("__VERSION__", ObjKind::Str(VERSION.to_string()));
        self.define_constant("__LIB_PATH__", ObjKind::Str(self.lib_path.clone()));
        self.define_constant("__INC_PATH__", ObjKind::Str(self.inc_path.clone()));
        self.define_constant(
            "argc",
            ObjKind::Int(self.args.script_args.len() as i64),
        );
        for (i, arg) in self.args.script_args.clone().iter().enumerate() {
            self.define_constant(&i.to_string(), ObjKind::Str(arg.clone()));
        }
    }

    // ------------------------------------------------------------------
    // locks
    // ------------------------------------------------------------------

    pub fn gc(&self) -> MutexGuard<'_, Gc> {
        lock(&self.gc)
    }

    pub fn scopes(&self) -> MutexGuard<'_, ScopePool> {
        lock(&self.scopes)
    }

    pub fn mcache(&self) -> MutexGuard<'_, HashMap<String, Arc<NamedFunction>>> {
        lock(&self.mcache)
    }

    pub fn pcre_cache(&self) -> MutexGuard<'_, HashMap<String, Arc<Regex>>> {
        lock(&self.pcre_cache)
    }

    pub fn modules(&self) -> MutexGuard<'_, Vec<Arc<Module>>> {
        lock(&self.modules)
    }

    pub fn handles(&self) -> MutexGuard<'_, HashMap<u64, std::fs::File>> {
        lock(&self.handles)
    }

    pub fn threads(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        lock(&self.threads)
    }

    // ------------------------------------------------------------------
    // allocation
    // ------------------------------------------------------------------

    /// Allocate a tracked value. Exceeding the memory cap is fatal.
    pub fn track(&self, kind: ObjKind) -> ObjRef {
        match self.gc().track(kind) {
            Ok(obj) => obj,
            Err(err) => self.fatal(&err),
        }
    }

    /// The defaulted unit value every expression without one returns.
    pub fn unit(&self) -> ObjRef {
        self.unit.clone()
    }

    /// Intern the value of a literal node: constants are shared across
    /// evaluations and flagged so the collector skips them.
    pub fn literal_const(&self, node: &Arc<Node>, literal: &Literal) -> ObjRef {
        let key = Arc::as_ptr(node) as usize;
        if let Some(interned) = lock(&self.node_consts).get(&key) {
            return interned.clone();
        }
        let kind = match literal {
            Literal::Int(v) => ObjKind::Int(*v),
            Literal::Float(v) => ObjKind::Float(*v),
            Literal::Char(c) => ObjKind::Char(*c),
            Literal::Str(s) => ObjKind::Str(s.clone()),
        };
        let obj = self.track(kind);
        obj.set_constant();
        lock(&self.node_consts).insert(key, obj.clone());
        obj
    }

    /// Deep-clone a value, as the `new` operator does with a type
    /// prototype. Static class attributes keep their shared storage.
    pub fn clone_obj(&self, o: &ObjRef) -> ObjRef {
        let kind = o.kind().clone();
        let cloned = match kind {
            ObjKind::Vector(items) => {
                ObjKind::Vector(items.iter().map(|i| self.clone_obj(i)).collect())
            }
            ObjKind::Map(entries) => ObjKind::Map(
                entries
                    .iter()
                    .map(|(k, v)| (self.clone_obj(k), self.clone_obj(v)))
                    .collect(),
            ),
            ObjKind::Matrix(mut m) => {
                m.cells = m.cells.iter().map(|c| self.clone_obj(c)).collect();
                ObjKind::Matrix(m)
            }
            ObjKind::Struct(mut s) => {
                s.attributes = s
                    .attributes
                    .iter()
                    .map(|(label, v)| (label.clone(), self.clone_obj(v)))
                    .collect();
                ObjKind::Struct(s)
            }
            ObjKind::Class(mut c) => {
                for attr in &mut c.attributes {
                    if !attr.is_static {
                        attr.value = self.clone_obj(&attr.value);
                    }
                }
                ObjKind::Class(c)
            }
            scalar => scalar,
        };
        self.track(cloned)
    }

    // ------------------------------------------------------------------
    // segments
    // ------------------------------------------------------------------

    pub fn define_constant(&self, name: &str, kind: ObjKind) -> ObjRef {
        let obj = self.track(kind);
        obj.set_constant();
        lock(&self.vconst).push((name.to_string(), obj.clone()));
        obj
    }

    pub fn get_constant(&self, name: &str) -> Option<ObjRef> {
        lock(&self.vconst)
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, obj)| obj.clone())
    }

    /// Register a user-defined type prototype (struct or class), exempt
    /// from collection.
    pub fn define_type(&self, name: &str, prototype: ObjRef) {
        prototype.set_constant();
        lock(&self.vtypes).push((name.to_string(), prototype));
    }

    pub fn get_type(&self, name: &str) -> Option<ObjRef> {
        lock(&self.vtypes)
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, obj)| obj.clone())
    }

    /// Register a user function declaration. The returned index is what
    /// an alias value holds.
    pub fn define_function(&self, name: &str, node: Arc<Node>) -> Result<usize, HybrisError> {
        let mut vcode = lock(&self.vcode);
        if vcode.iter().any(|(label, _)| label == name) {
            return Err(HybrisError::syntax(format!(
                "function '{}' already defined",
                name
            )));
        }
        vcode.push((name.to_string(), node));
        Ok(vcode.len() - 1)
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        lock(&self.vcode).iter().position(|(label, _)| label == name)
    }

    pub fn function_node(&self, name: &str) -> Option<Arc<Node>> {
        lock(&self.vcode)
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, node)| node.clone())
    }

    pub fn function_by_index(&self, index: usize) -> Option<(String, Arc<Node>)> {
        lock(&self.vcode)
            .get(index)
            .map(|(label, node)| (label.clone(), node.clone()))
    }

    pub fn user_function_names(&self) -> Vec<String> {
        lock(&self.vcode).iter().map(|(label, _)| label.clone()).collect()
    }

    /// Resolve a native function through the lookup cache; on a miss,
    /// scan the loaded modules in load order — the first match wins —
    /// and remember the result.
    pub fn native_function(&self, identifier: &str) -> Option<Arc<NamedFunction>> {
        if let Some(hit) = self.mcache().get(identifier) {
            return Some(hit.clone());
        }
        let modules: Vec<Arc<Module>> = self.modules().clone();
        for module in &modules {
            for function in &module.functions {
                if function.identifier == identifier {
                    self.mcache()
                        .insert(identifier.to_string(), function.clone());
                    return Some(function.clone());
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // paths, diagnostics, state
    // ------------------------------------------------------------------

    pub fn lib_path(&self) -> &str {
        &self.lib_path
    }

    pub fn inc_path(&self) -> &str {
        &self.inc_path
    }

    pub fn set_lineno(&self, line: usize) {
        *lock(&self.lineno) = line;
    }

    pub fn lineno(&self) -> usize {
        *lock(&self.lineno)
    }

    pub fn main_frame(&self) -> Frame {
        self.main_frame.clone()
    }

    /// Push a call frame onto the current thread's scope, enforcing the
    /// recursion limit.
    pub fn push_frame(&self, frame: Frame) -> Result<(), HybrisError> {
        let mut scopes = self.scopes();
        if scopes.depth() >= crate::frame::MAX_RECURSION {
            return Err(HybrisError::new(
                ErrorKind::StackOverflow,
                "reached max number of nested calls",
            ));
        }
        scopes.push_frame(frame);
        Ok(())
    }

    pub fn pop_frame(&self) {
        self.scopes().pop_frame();
    }

    /// Raise an error into a frame: the rendered message becomes the
    /// exception value, pinned alive so a collection between throw and
    /// catch cannot reclaim it. Returns the unit value the failed
    /// expression evaluates to.
    pub fn raise(&self, frame: &Frame, err: HybrisError) -> ObjRef {
        if err.kind == ErrorKind::OutOfMemory {
            self.fatal(&err);
        }
        let exception = self.track(ObjKind::Str(err.to_string()));
        crate::gc::mark(&exception, true);
        frame.set_state(StateKind::Exception, Some(exception));
        self.unit()
    }

    /// Fatal runtime fault: print the diagnostic and the stack trace
    /// unconditionally, then terminate.
    pub fn fatal(&self, err: &HybrisError) -> ! {
        eprintln!("\x1b[22;31mERROR : {} .\x1b[00m", err);
        self.print_stack_trace(true);
        std::process::exit(1);
    }

    /// Print the calling stack trace of the current thread's scope.
    pub fn print_stack_trace(&self, force: bool) {
        if !self.args.stacktrace && !force {
            return;
        }
        let usage = self.gc().usage();
        let frames = self.scopes().current_frames();
        eprintln!("\nCall Stack [memory usage {} bytes] :\n", usage);
        for (i, frame) in frames.iter().enumerate() {
            let owner = frame.owner();
            let pad = "  ".repeat(i + 1);
            if owner == "<main>" {
                eprintln!("{}<main>", pad);
            } else {
                eprintln!("{}{}()", pad, owner);
            }
        }
        eprintln!();
    }

    /// Cooperative cancellation check for worker threads, polled at
    /// statement boundaries.
    pub fn poll_kill(&self) -> bool {
        let tid = std::thread::current().id();
        let scopes = self.scopes();
        if tid == scopes.main_tid() {
            return false;
        }
        scopes
            .kill_flag(tid)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn next_handle_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_thread_id(&self) -> u64 {
        self.next_thread.fetch_add(1, Ordering::SeqCst)
    }

    /// Script output sink.
    pub fn write_out(&self, text: &str) {
        let mut out = lock(&self.output);
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    /// Tear the VM down: report workers that never finished, surface an
    /// unhandled exception left on the main frame, release every
    /// tracked object.
    pub fn release(&self) {
        let worker_ids: Vec<u64> = self.threads().keys().copied().collect();
        if !worker_ids.is_empty() {
            tracing::warn!(
                workers = worker_ids.len(),
                "abandoning worker threads still running at shutdown"
            );
        }

        if self.main_frame.is_state(StateKind::Exception) {
            self.main_frame.unset_state(StateKind::Exception);
            let rendered = self
                .main_frame
                .state_value()
                .map(|v| value::svalue(&v))
                .unwrap_or_default();
            eprintln!("\x1b[22;31mERROR : Unhandled exception : {} .\x1b[00m", rendered);
            self.print_stack_trace(false);
        }

        self.gc().release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_constants() {
        let vm = Vm::new(VmArgs {
            script_args: vec!["one".to_string(), "two".to_string()],
            ..VmArgs::default()
        });
        assert_eq!(value::lvalue(&vm.get_constant("true").unwrap()), 1);
        assert_eq!(value::lvalue(&vm.get_constant("false").unwrap()), 0);
        assert_eq!(value::svalue(&vm.get_constant("null").unwrap()), "null");
        assert_eq!(value::lvalue(&vm.get_constant("argc").unwrap()), 2);
        assert_eq!(value::svalue(&vm.get_constant("0").unwrap()), "one");
        assert_eq!(value::svalue(&vm.get_constant("1").unwrap()), "two");
        assert_eq!(
            value::svalue(&vm.get_constant("__VERSION__").unwrap()),
            VERSION
        );
    }

    #[test]
    fn test_constants_are_flagged() {
        let vm = Vm::new(VmArgs::default());
        assert!(vm.get_constant("true").unwrap().is_constant());
        assert!(vm.unit().is_constant());
    }

    #[test]
    fn test_define_function_rejects_duplicates() {
        let vm = Vm::new(VmArgs::default());
        let node = Arc::new(Node::new(hybris_parser::ast::NodeKind::Block, 1));
        vm.define_function("f", node.clone()).unwrap();
        let err = vm.define_function("f", node).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Syntax);
    }

    #[test]
    fn test_raise_pins_exception_and_sets_state() {
        let vm = Vm::new(VmArgs::default());
        let frame = Frame::new("t");
        vm.raise(&frame, HybrisError::name("'x' undeclared identifier"));
        assert!(frame.is_state(StateKind::Exception));
        let exception = frame.state_value().unwrap();
        assert!(exception.is_referenced());
        assert_eq!(
            value::svalue(&exception),
            "NameError: 'x' undeclared identifier"
        );
    }

    #[test]
    fn test_push_frame_enforces_recursion_limit() {
        let vm = Vm::new(VmArgs::default());
        // fill up to exactly the limit
        while vm.scopes().depth() < crate::frame::MAX_RECURSION {
            vm.push_frame(Frame::new("f")).unwrap();
        }
        let err = vm.push_frame(Frame::new("one too many")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StackOverflow);
    }

    #[test]
    fn test_literal_const_interns_per_node() {
        let vm = Vm::new(VmArgs::default());
        let node = Arc::new(Node::new(
            hybris_parser::ast::NodeKind::Constant(Literal::Int(7)),
            1,
        ));
        let first = vm.literal_const(&node, &Literal::Int(7));
        let second = vm.literal_const(&node, &Literal::Int(7));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_constant());
    }

    #[test]
    fn test_clone_obj_deep_clones_collections() {
        let vm = Vm::new(VmArgs::default());
        let inner = vm.track(ObjKind::Int(1));
        let original = vm.track(ObjKind::Vector(vec![inner.clone()]));
        let cloned = vm.clone_obj(&original);
        assert!(!Arc::ptr_eq(&original, &cloned));
        assert!(crate::ops::equals(&original, &cloned));
        // mutating the clone leaves the original untouched
        crate::ops::cl_push(&cloned, &vm.track(ObjKind::Int(2))).unwrap();
        assert_eq!(value::get_size(&original), 1);
    }
}
