//! Frames and per-thread scopes.
//!
//! A frame is an ordered identifier-to-value mapping plus a control-flow
//! state; it owns no value (the collector does) but roots every value it
//! names. A scope is the ordered list of frames belonging to one thread:
//! the main thread's scope lives on the VM, worker scopes are registered
//! in a thread-id-keyed map behind the scope mutex.
//!
//! Frames are shared (`Arc<Mutex<…>>`) because the thread that owns one
//! mutates it while the collector walks it as a GC root. Every accessor
//! locks internally and no lock is held across evaluation.

use crate::value::ObjRef;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

/// Nesting limit: recursion to exactly this depth succeeds, one more
/// frame raises `StackOverflow`.
pub const MAX_RECURSION: usize = 10_000;

/// Control-flow states a statement can leave on its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Break,
    Next,
    Return,
    Exception,
}

impl StateKind {
    fn bit(self) -> u8 {
        match self {
            StateKind::Break => 0b0001,
            StateKind::Next => 0b0010,
            StateKind::Return => 0b0100,
            StateKind::Exception => 0b1000,
        }
    }
}

/// State bitfield plus the carried value (return value or exception
/// object).
#[derive(Debug, Default)]
pub struct FrameState {
    flags: u8,
    pub value: Option<ObjRef>,
}

impl FrameState {
    pub fn set(&mut self, kind: StateKind, value: Option<ObjRef>) {
        self.flags |= kind.bit();
        if value.is_some() {
            self.value = value;
        }
    }

    pub fn unset(&mut self, kind: StateKind) {
        self.flags &= !kind.bit();
    }

    pub fn is(&self, kind: StateKind) -> bool {
        self.flags & kind.bit() != 0
    }
}

#[derive(Debug)]
struct FrameInner {
    owner: String,
    slots: Vec<(String, ObjRef)>,
    tmp: Vec<ObjRef>,
    state: FrameState,
}

/// A shared frame handle.
#[derive(Debug, Clone)]
pub struct Frame(Arc<Mutex<FrameInner>>);

impl Frame {
    pub fn new(owner: impl Into<String>) -> Self {
        Frame(Arc::new(Mutex::new(FrameInner {
            owner: owner.into(),
            slots: Vec::new(),
            tmp: Vec::new(),
            state: FrameState::default(),
        })))
    }

    fn inner(&self) -> MutexGuard<'_, FrameInner> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn owner(&self) -> String {
        self.inner().owner.clone()
    }

    /// Identity comparison: two handles to the same frame.
    pub fn same(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn size(&self) -> usize {
        self.inner().slots.len()
    }

    /// Look a name up in this frame.
    pub fn get(&self, name: &str) -> Option<ObjRef> {
        self.inner()
            .slots
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, value)| value.clone())
    }

    /// Append a binding without checking for duplicates.
    pub fn insert(&self, name: impl Into<String>, value: ObjRef) {
        self.inner().slots.push((name.into(), value));
    }

    /// Insert-or-replace; returns the bound value.
    pub fn add(&self, name: &str, value: ObjRef) -> ObjRef {
        let mut inner = self.inner();
        for (label, slot) in &mut inner.slots {
            if label == name {
                *slot = value.clone();
                return value;
            }
        }
        inner.slots.push((name.to_string(), value.clone()));
        value
    }

    /// Append an anonymous positional slot (extra call arguments).
    pub fn push(&self, value: ObjRef) {
        self.inner().slots.push((String::new(), value));
    }

    pub fn at(&self, index: usize) -> Option<ObjRef> {
        self.inner().slots.get(index).map(|(_, v)| v.clone())
    }

    pub fn label(&self, index: usize) -> Option<String> {
        self.inner().slots.get(index).map(|(l, _)| l.clone())
    }

    /// Root a value that is live during the current statement but not
    /// yet bound to a name (the iterable a `foreach` walks, for one).
    pub fn push_tmp(&self, value: ObjRef) {
        self.inner().tmp.push(value);
    }

    pub fn remove_tmp(&self, value: &ObjRef) {
        let mut inner = self.inner();
        if let Some(i) = inner.tmp.iter().position(|t| Arc::ptr_eq(t, value)) {
            inner.tmp.remove(i);
        }
    }

    /// Everything this frame keeps alive: bindings, temporary roots and
    /// a carried state value.
    pub fn roots(&self) -> Vec<ObjRef> {
        let inner = self.inner();
        let mut roots: Vec<ObjRef> = inner.slots.iter().map(|(_, v)| v.clone()).collect();
        roots.extend(inner.tmp.iter().cloned());
        if let Some(value) = &inner.state.value {
            roots.push(value.clone());
        }
        roots
    }

    pub fn set_state(&self, kind: StateKind, value: Option<ObjRef>) {
        self.inner().state.set(kind, value);
    }

    pub fn unset_state(&self, kind: StateKind) {
        self.inner().state.unset(kind);
    }

    pub fn is_state(&self, kind: StateKind) -> bool {
        self.inner().state.is(kind)
    }

    pub fn state_value(&self) -> Option<ObjRef> {
        self.inner().state.value.clone()
    }

    pub fn clear_state_value(&self) {
        self.inner().state.value = None;
    }
}

/// A worker thread's scope plus its cooperative kill flag.
#[derive(Debug)]
pub struct WorkerScope {
    pub frames: Vec<Frame>,
    pub kill: Arc<AtomicBool>,
}

/// All scopes of the VM, keyed by thread. Guarded by the VM's scope
/// mutex — the second mutex in the acquisition order.
#[derive(Debug)]
pub struct ScopePool {
    main_tid: ThreadId,
    main: Vec<Frame>,
    threads: HashMap<ThreadId, WorkerScope>,
}

impl ScopePool {
    pub fn new(main_frame: Frame) -> Self {
        ScopePool {
            main_tid: thread::current().id(),
            main: vec![main_frame],
            threads: HashMap::new(),
        }
    }

    pub fn main_tid(&self) -> ThreadId {
        self.main_tid
    }

    /// Register an empty scope for a worker thread. The caller holds the
    /// scope mutex across thread creation and this registration, which
    /// is the startup rendez-vous.
    pub fn register_thread(&mut self, tid: ThreadId, kill: Arc<AtomicBool>) {
        self.threads.insert(
            tid,
            WorkerScope {
                frames: Vec::new(),
                kill,
            },
        );
    }

    pub fn deregister_thread(&mut self, tid: ThreadId) {
        self.threads.remove(&tid);
    }

    pub fn kill_flag(&self, tid: ThreadId) -> Option<Arc<AtomicBool>> {
        self.threads.get(&tid).map(|scope| scope.kill.clone())
    }

    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.keys().copied().collect()
    }

    fn scope_mut(&mut self, tid: ThreadId) -> &mut Vec<Frame> {
        if tid == self.main_tid {
            &mut self.main
        } else {
            &mut self
                .threads
                .entry(tid)
                .or_insert_with(|| WorkerScope {
                    frames: Vec::new(),
                    kill: Arc::new(AtomicBool::new(false)),
                })
                .frames
        }
    }

    fn scope(&self, tid: ThreadId) -> &[Frame] {
        if tid == self.main_tid {
            &self.main
        } else {
            self.threads
                .get(&tid)
                .map(|scope| scope.frames.as_slice())
                .unwrap_or(&[])
        }
    }

    pub fn push_frame(&mut self, frame: Frame) {
        self.scope_mut(thread::current().id()).push(frame);
    }

    /// Push a frame onto another thread's scope — the parent seeding a
    /// worker's root frame during the startup rendez-vous.
    pub fn push_frame_for(&mut self, tid: ThreadId, frame: Frame) {
        self.scope_mut(tid).push(frame);
    }

    pub fn pop_frame(&mut self) {
        self.scope_mut(thread::current().id()).pop();
    }

    /// Depth of the calling thread's scope.
    pub fn depth(&self) -> usize {
        self.scope(thread::current().id()).len()
    }

    /// The calling thread's frames, oldest first.
    pub fn current_frames(&self) -> Vec<Frame> {
        self.scope(thread::current().id()).to_vec()
    }

    /// Every frame of every scope — the collector's root set.
    pub fn all_frames(&self) -> Vec<Frame> {
        let mut frames = self.main.clone();
        for scope in self.threads.values() {
            frames.extend(scope.frames.iter().cloned());
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{self, Obj};

    #[test]
    fn test_add_is_insert_or_replace() {
        let frame = Frame::new("test");
        frame.add("x", Obj::int(1));
        frame.add("x", Obj::int(2));
        assert_eq!(frame.size(), 1);
        assert_eq!(value::lvalue(&frame.get("x").unwrap()), 2);
    }

    #[test]
    fn test_positional_slots_keep_order() {
        let frame = Frame::new("test");
        frame.insert("a", Obj::int(1));
        frame.push(Obj::int(2));
        assert_eq!(frame.label(0).unwrap(), "a");
        assert_eq!(frame.label(1).unwrap(), "");
        assert_eq!(value::lvalue(&frame.at(1).unwrap()), 2);
        assert!(frame.at(2).is_none());
    }

    #[test]
    fn test_state_flags_compose() {
        let frame = Frame::new("test");
        assert!(!frame.is_state(StateKind::Return));
        frame.set_state(StateKind::Return, Some(Obj::int(7)));
        frame.set_state(StateKind::Break, None);
        assert!(frame.is_state(StateKind::Return));
        assert!(frame.is_state(StateKind::Break));
        // unsetting one flag keeps the other and the carried value
        frame.unset_state(StateKind::Break);
        assert!(frame.is_state(StateKind::Return));
        assert_eq!(value::lvalue(&frame.state_value().unwrap()), 7);
    }

    #[test]
    fn test_tmp_roots_show_up_in_roots() {
        let frame = Frame::new("test");
        let tmp = Obj::int(9);
        frame.push_tmp(tmp.clone());
        assert!(frame.roots().iter().any(|r| Arc::ptr_eq(r, &tmp)));
        frame.remove_tmp(&tmp);
        assert!(frame.roots().is_empty());
    }

    #[test]
    fn test_scope_pool_push_pop_depth() {
        let mut pool = ScopePool::new(Frame::new("<main>"));
        assert_eq!(pool.depth(), 1);
        pool.push_frame(Frame::new("f"));
        assert_eq!(pool.depth(), 2);
        pool.pop_frame();
        assert_eq!(pool.depth(), 1);
    }

    #[test]
    fn test_worker_scope_registration() {
        let mut pool = ScopePool::new(Frame::new("<main>"));
        let handle = std::thread::spawn(|| std::thread::current().id());
        let tid = handle.join().expect("worker thread");
        pool.register_thread(tid, Arc::new(AtomicBool::new(false)));
        assert!(pool.kill_flag(tid).is_some());
        assert_eq!(pool.all_frames().len(), 1);
        pool.deregister_thread(tid);
        assert!(pool.kill_flag(tid).is_none());
    }

    #[test]
    fn test_frames_balance_in_all_frames() {
        let mut pool = ScopePool::new(Frame::new("<main>"));
        let before = pool.all_frames().len();
        pool.push_frame(Frame::new("f"));
        pool.pop_frame();
        assert_eq!(pool.all_frames().len(), before);
    }
}
