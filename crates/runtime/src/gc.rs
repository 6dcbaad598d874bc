//! Mark-and-sweep collector with a lag space.
//!
//! Three tracked lists: `heap` holds young objects, `lag` holds objects
//! that survived enough collections to be scanned less often, and
//! `constants` holds objects that live until VM shutdown. Each tracked
//! item records the object, its allocation size and a survival counter.
//!
//! A cycle marks every value reachable from every registered frame
//! (plus the frames' temporary roots), sweeps `lag` only when it has
//! outgrown `heap`, always sweeps `heap`, and promotes heap survivors
//! whose survival ratio passed the lag threshold. Sweeping an object
//! clears its payload instead of recursively freeing children — the
//! children are tracked roots of their own, and dropping the child
//! `Arc`s is what lets reference cycles fall apart.

use crate::error::{ErrorKind, HybrisError};
use crate::value::{self, Obj, ObjKind, ObjRef};
use crate::vm::Vm;

/// Collection is triggered past this many tracked bytes.
pub const DEFAULT_COLLECT_THRESHOLD: usize = 2 * 1024 * 1024;
/// Exceeding this many tracked bytes is fatal.
pub const DEFAULT_MM_THRESHOLD: usize = 128 * 1024 * 1024;
/// An object whose survivals / collections ratio reaches this migrates
/// from `heap` to `lag`.
pub const DEFAULT_LAG_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy)]
pub struct GcConfig {
    pub collect_threshold: usize,
    pub mm_threshold: usize,
    pub lag_threshold: f64,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            collect_threshold: DEFAULT_COLLECT_THRESHOLD,
            mm_threshold: DEFAULT_MM_THRESHOLD,
            lag_threshold: DEFAULT_LAG_THRESHOLD,
        }
    }
}

/// One tracked allocation.
struct Tracked {
    obj: ObjRef,
    size: usize,
    survivals: usize,
}

/// Collector state. Guarded by the VM's GC mutex — the first mutex in
/// the acquisition order.
pub struct Gc {
    config: GcConfig,
    heap: Vec<Tracked>,
    lag: Vec<Tracked>,
    constants: Vec<Tracked>,
    /// Completed collection cycles.
    pub collections: usize,
    usage: usize,
}

impl Gc {
    pub fn new(config: GcConfig) -> Self {
        Gc {
            config,
            heap: Vec::new(),
            lag: Vec::new(),
            constants: Vec::new(),
            collections: 0,
            usage: 0,
        }
    }

    /// Hand a freshly built payload to the collector. Fails with
    /// `OutOfMemory` once the memory cap is reached; the caller treats
    /// that as fatal.
    pub fn track(&mut self, kind: ObjKind) -> Result<ObjRef, HybrisError> {
        if self.usage >= self.config.mm_threshold {
            return Err(HybrisError::new(
                ErrorKind::OutOfMemory,
                format!(
                    "reached max allowed memory usage ({} bytes)",
                    self.config.mm_threshold
                ),
            ));
        }
        let size = kind.byte_size();
        let obj = Obj::new(kind);
        self.usage += size;
        self.heap.push(Tracked {
            obj: obj.clone(),
            size,
            survivals: 0,
        });
        Ok(obj)
    }

    pub fn usage(&self) -> usize {
        self.usage
    }

    pub fn items(&self) -> usize {
        self.heap.len() + self.lag.len() + self.constants.len()
    }

    pub fn collect_threshold(&self) -> usize {
        self.config.collect_threshold
    }

    pub fn mm_threshold(&self) -> usize {
        self.config.mm_threshold
    }

    pub fn set_collect_threshold(&mut self, threshold: usize) -> usize {
        std::mem::replace(&mut self.config.collect_threshold, threshold)
    }

    pub fn set_mm_threshold(&mut self, threshold: usize) -> usize {
        std::mem::replace(&mut self.config.mm_threshold, threshold)
    }

    pub fn needs_collect(&self) -> bool {
        self.usage >= self.config.collect_threshold
    }

    /// Sweep one list. Constants migrate to the constants list, marked
    /// survivors are unmarked and counted, unmarked objects are freed.
    /// Heap survivors past the lag ratio are promoted.
    fn sweep(&mut self, which: Space) -> (usize, usize) {
        let collections = self.collections.max(1);
        let lag_threshold = self.config.lag_threshold;
        let list = match which {
            Space::Heap => std::mem::take(&mut self.heap),
            Space::Lag => std::mem::take(&mut self.lag),
        };
        let mut freed = 0;
        let mut promoted = 0;
        for mut tracked in list {
            if tracked.obj.is_constant() {
                tracked.obj.set_referenced(false);
                self.constants.push(tracked);
                continue;
            }
            if tracked.obj.is_referenced() {
                tracked.obj.set_referenced(false);
                tracked.survivals += 1;
                let lagging =
                    tracked.survivals as f64 / collections as f64 >= lag_threshold;
                match which {
                    Space::Heap if lagging => {
                        promoted += 1;
                        self.lag.push(tracked);
                    }
                    Space::Heap => self.heap.push(tracked),
                    Space::Lag => self.lag.push(tracked),
                }
                continue;
            }
            // unreachable: release the payload so child Arcs drop, then
            // forget the object
            self.usage = self.usage.saturating_sub(tracked.size);
            *tracked.obj.kind() = ObjKind::Int(0);
            freed += 1;
        }
        (freed, promoted)
    }

    fn clear_marks(list: &[Tracked]) {
        for tracked in list {
            tracked.obj.set_referenced(false);
        }
    }

    /// Free every tracked object, constants included. Only meaningful
    /// at VM shutdown.
    pub fn release(&mut self) {
        for tracked in self
            .heap
            .drain(..)
            .chain(self.lag.drain(..))
            .chain(self.constants.drain(..))
        {
            *tracked.obj.kind() = ObjKind::Int(0);
        }
        self.usage = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Space {
    Heap,
    Lag,
}

/// Recursively flip the `referenced` flag on a value and everything it
/// owns. Short-circuits when the flag is already in the target state,
/// which is what terminates cycles in the object graph.
pub fn mark(o: &ObjRef, alive: bool) {
    if o.is_referenced() == alive {
        return;
    }
    o.set_referenced(alive);
    let mut index = 0;
    while let Some(child) = value::traverse(o, index) {
        mark(&child, alive);
        index += 1;
    }
}

/// Run a collection cycle if tracked usage passed the threshold.
///
/// Called by the engine at statement boundaries only — never in the
/// middle of expression evaluation, so in-flight temporaries stay
/// rooted by the frames that will receive them.
pub fn collect(vm: &Vm) {
    if !vm.gc().needs_collect() {
        return;
    }
    collect_now(vm);
}

/// Run a collection cycle unconditionally (the `gc_collect` builtin).
pub fn collect_now(vm: &Vm) {
    let mut gc = vm.gc();

    let before = gc.usage();

    // Roots: every binding and temporary root of every frame of every
    // registered scope. The scope map stays locked for the whole walk
    // so a thread tearing down cannot race the iteration.
    {
        let scopes = vm.scopes();
        for frame in scopes.all_frames() {
            for root in frame.roots() {
                mark(&root, true);
            }
        }
    }

    gc.collections += 1;

    let mut freed = 0;
    let mut promoted = 0;
    let sweep_lag = gc.lag.len() > gc.heap.len();
    if sweep_lag {
        let (f, _) = gc.sweep(Space::Lag);
        freed += f;
    }
    let (f, p) = gc.sweep(Space::Heap);
    freed += f;
    promoted += p;

    // whatever was not swept this cycle still has to come out of the
    // cycle unmarked
    if !sweep_lag {
        Gc::clear_marks(&gc.lag);
    }
    Gc::clear_marks(&gc.constants);

    tracing::debug!(
        before_bytes = before,
        after_bytes = gc.usage(),
        freed,
        promoted,
        cycle = gc.collections,
        "collection cycle"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Obj;

    fn small_gc() -> Gc {
        Gc::new(GcConfig {
            collect_threshold: 1024,
            mm_threshold: 4096,
            lag_threshold: 0.7,
        })
    }

    #[test]
    fn test_track_counts_usage_and_items() {
        let mut gc = small_gc();
        let o = gc.track(ObjKind::Str("hello".to_string())).unwrap();
        assert_eq!(gc.items(), 1);
        assert!(gc.usage() > 0);
        assert_eq!(value::svalue(&o), "hello");
    }

    #[test]
    fn test_track_fails_past_memory_cap() {
        let mut gc = Gc::new(GcConfig {
            collect_threshold: 16,
            mm_threshold: 64,
            lag_threshold: 0.7,
        });
        let mut last = Ok(());
        for _ in 0..64 {
            match gc.track(ObjKind::Str("x".repeat(64))) {
                Ok(_) => {}
                Err(e) => {
                    last = Err(e);
                    break;
                }
            }
        }
        let err = last.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_mark_sets_and_clears_recursively() {
        let child = Obj::int(1);
        let parent = Obj::vector(vec![child.clone()]);
        mark(&parent, true);
        assert!(parent.is_referenced());
        assert!(child.is_referenced());
        mark(&parent, false);
        assert!(!parent.is_referenced());
        assert!(!child.is_referenced());
    }

    #[test]
    fn test_mark_terminates_on_cycles() {
        let v = Obj::vector(vec![]);
        if let ObjKind::Vector(items) = &mut *v.kind() {
            items.push(v.clone());
        }
        mark(&v, true);
        assert!(v.is_referenced());
        mark(&v, false);
        assert!(!v.is_referenced());
    }

    #[test]
    fn test_sweep_frees_unmarked_and_keeps_marked() {
        let mut gc = small_gc();
        gc.collections = 1;
        let live = gc.track(ObjKind::Str("live".to_string())).unwrap();
        let _dead = gc.track(ObjKind::Str("dead".to_string())).unwrap();
        let before = gc.usage();

        mark(&live, true);
        let (freed, _) = gc.sweep(Space::Heap);
        assert_eq!(freed, 1);
        assert!(gc.usage() < before);
        assert_eq!(gc.heap.len(), 1);
        // survivors leave the cycle unmarked
        assert!(!live.is_referenced());
    }

    #[test]
    fn test_constants_migrate_and_are_never_freed() {
        let mut gc = small_gc();
        gc.collections = 1;
        let constant = gc.track(ObjKind::Str("forever".to_string())).unwrap();
        constant.set_constant();
        // not marked, but constant: must survive into the constants list
        let (freed, _) = gc.sweep(Space::Heap);
        assert_eq!(freed, 0);
        assert_eq!(gc.constants.len(), 1);
        assert_eq!(value::svalue(&constant), "forever");
        // and it never leaves
        let (freed, _) = gc.sweep(Space::Heap);
        assert_eq!(freed, 0);
        assert_eq!(gc.constants.len(), 1);
    }

    #[test]
    fn test_promotion_to_lag_space() {
        let mut gc = small_gc();
        let survivor = gc.track(ObjKind::Str("old".to_string())).unwrap();
        // surviving the first cycle gives a ratio of 1/1, past 0.7
        gc.collections = 1;
        mark(&survivor, true);
        gc.sweep(Space::Heap);
        assert_eq!(gc.lag.len(), 1, "survivor should promote at full ratio");
        assert_eq!(gc.heap.len(), 0);
    }

    #[test]
    fn test_sweeping_collection_does_not_free_children() {
        let mut gc = small_gc();
        gc.collections = 1;
        let child = gc.track(ObjKind::Str("child".to_string())).unwrap();
        let parent = gc.track(ObjKind::Vector(vec![child.clone()])).unwrap();
        // only the child is reachable this cycle
        mark(&child, true);
        let (freed, _) = gc.sweep(Space::Heap);
        assert_eq!(freed, 1);
        // parent payload was cleared, child is untouched
        assert!(matches!(*parent.kind(), ObjKind::Int(0)));
        assert_eq!(value::svalue(&child), "child");
    }

    #[test]
    fn test_cycle_memory_is_reclaimed() {
        let mut gc = small_gc();
        gc.collections = 1;
        let a = gc.track(ObjKind::Vector(vec![])).unwrap();
        let b = gc.track(ObjKind::Vector(vec![a.clone()])).unwrap();
        if let ObjKind::Vector(items) = &mut *a.kind() {
            items.push(b.clone());
        }
        let a_weak = std::sync::Arc::downgrade(&a);
        let b_weak = std::sync::Arc::downgrade(&b);
        drop(a);
        drop(b);
        let (freed, _) = gc.sweep(Space::Heap);
        assert_eq!(freed, 2);
        // payload clearing broke the cycle: both objects deallocated
        assert!(a_weak.upgrade().is_none());
        assert!(b_weak.upgrade().is_none());
    }

    #[test]
    fn test_threshold_setters_return_previous() {
        let mut gc = small_gc();
        let old = gc.set_collect_threshold(9999);
        assert_eq!(old, 1024);
        assert_eq!(gc.collect_threshold(), 9999);
        let old = gc.set_mm_threshold(123_456);
        assert_eq!(old, 4096);
        assert_eq!(gc.mm_threshold(), 123_456);
    }

    #[test]
    fn test_release_frees_everything() {
        let mut gc = small_gc();
        let constant = gc.track(ObjKind::Str("c".to_string())).unwrap();
        constant.set_constant();
        gc.track(ObjKind::Str("h".to_string())).unwrap();
        gc.sweep(Space::Heap); // migrate the constant
        gc.release();
        assert_eq!(gc.items(), 0);
        assert_eq!(gc.usage(), 0);
    }
}
