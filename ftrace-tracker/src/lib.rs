//! The active-flow map: per-object lightweight state tracked while an object is
//! alive, plus reclamation detection for objects that become unreachable without
//! ever reporting a terminal release.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use fnv::FnvHashMap;
use ftrace_intern::MethodSignature;
use ftrace_trie::{BoundedImprintTrie, ImprintNode, RefCountBucket};
use parking_lot::{Mutex, RwLock};

/// The capability set a host-language object kind must provide (§9: "Inheritance /
/// polymorphism ... becomes a capability set"). Implementors are typically a thin
/// wrapper the instrumentation constructs once per tracked allocation.
pub trait TrackedObject: Send + Sync + 'static {
    /// A stable identity for the lifetime of the object. Defaults to the address
    /// of the implementing value, which is stable for as long as any `Arc` keeps
    /// it alive.
    fn identity(&self) -> u64 {
        self as *const Self as *const () as usize as u64
    }

    /// Whether this object is known to back an off-heap (direct) allocation.
    fn is_direct(&self) -> bool {
        false
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Per-object state maintained in the active map while the object is alive and not
/// yet known to be terminal.
pub struct WeakActiveFlow {
    obj_weak: Weak<dyn TrackedObject>,
    obj_identity: u64,
    current_node: Mutex<Arc<ImprintNode>>,
    depth: AtomicU16,
    is_direct: bool,
    completed: AtomicBool,
    creation_nanos: u64,
}

impl WeakActiveFlow {
    pub fn obj_identity(&self) -> u64 {
        self.obj_identity
    }

    pub fn is_direct(&self) -> bool {
        self.is_direct
    }

    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn depth(&self) -> u16 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn creation_nanos(&self) -> u64 {
        self.creation_nanos
    }

    pub fn current_node(&self) -> Arc<ImprintNode> {
        self.current_node.lock().clone()
    }

    /// Still alive right now. A momentary `upgrade` that is immediately dropped;
    /// true iff some `Arc` to the tracked object exists at this instant.
    pub fn is_alive(&self) -> bool {
        self.obj_weak.upgrade().is_some()
    }
}

/// Recommended cadence for the inline drain called from the hot path (§4.4).
pub const DEFAULT_DRAIN_EVERY: u64 = 100;

thread_local! {
    static THREAD_PRIMED: Cell<bool> = const { Cell::new(false) };
}

/// Concurrent map from object identity to active flow, plus reclamation detection.
///
/// There is no literal reference queue here: Rust's ownership model already gives
/// us a precise, synchronous answer to "has this object been reclaimed" via
/// `Weak::upgrade`, so `drain_gc_queue` scans the active map for entries whose weak
/// reference no longer upgrades, rather than consuming a push-based notification
/// queue. This is a faithful realization of the same contract (§9): every tracked
/// object that becomes unreachable without a terminal release is discovered by the
/// next drain and accounted for exactly once.
pub struct WeakActiveTracker {
    trie: Arc<BoundedImprintTrie>,
    active: RwLock<FnvHashMap<u64, Arc<WeakActiveFlow>>>,
    events_since_drain: AtomicU64,
    drain_every: u64,
}

impl WeakActiveTracker {
    pub fn new(trie: Arc<BoundedImprintTrie>) -> Self {
        WeakActiveTracker {
            trie,
            active: RwLock::new(FnvHashMap::default()),
            events_since_drain: AtomicU64::new(0),
            drain_every: DEFAULT_DRAIN_EVERY,
        }
    }

    pub fn with_drain_every(trie: Arc<BoundedImprintTrie>, drain_every: u64) -> Self {
        WeakActiveTracker {
            trie,
            active: RwLock::new(FnvHashMap::default()),
            events_since_drain: AtomicU64::new(0),
            drain_every,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn get(&self, obj_identity: u64) -> Option<Arc<WeakActiveFlow>> {
        self.active.read().get(&obj_identity).cloned()
    }

    /// Returns the flow for `obj`, creating one rooted at `root_sig` if none exists
    /// yet. If a flow already exists for this identity, it is returned unchanged
    /// (at-most-once root).
    pub fn get_or_create(
        &self,
        obj: &Arc<dyn TrackedObject>,
        root_sig: MethodSignature,
        is_direct: bool,
    ) -> Arc<WeakActiveFlow> {
        let identity = obj.identity();
        if let Some(existing) = self.active.read().get(&identity) {
            return existing.clone();
        }

        let mut active = self.active.write();
        if let Some(existing) = active.get(&identity) {
            return existing.clone();
        }

        let root = self.trie.get_or_create_root_with(root_sig, is_direct);
        let flow = Arc::new(WeakActiveFlow {
            obj_weak: Arc::downgrade(obj),
            obj_identity: identity,
            current_node: Mutex::new(root),
            depth: AtomicU16::new(0),
            is_direct,
            completed: AtomicBool::new(false),
            creation_nanos: now_nanos(),
        });
        active.insert(identity, flow.clone());
        flow
    }

    /// Marks the flow for `obj_identity` as completed by a confirmed terminal
    /// release, and records the release on its current node. Idempotent: a second
    /// call for an already-completed flow is a no-op beyond the lookup.
    pub fn record_clean_release(&self, obj_identity: u64) {
        let Some(flow) = self.active.read().get(&obj_identity).cloned() else {
            return;
        };
        if flow
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            flow.current_node().record_clean_release();
        }
    }

    /// Advances `flow` by one step, placing it under the child keyed by `(sig,
    /// ref_bucket)`. If the step is absorbed as a self-traversal (a cap was hit),
    /// only the node's traversal counter changes; depth does not advance.
    pub fn advance(&self, flow: &Arc<WeakActiveFlow>, sig: MethodSignature, ref_bucket: RefCountBucket) {
        let current = flow.current_node();
        let next = self.trie.get_or_create_child(&current, sig, ref_bucket);
        let advanced = !Arc::ptr_eq(&current, &next);
        *flow.current_node.lock() = next;
        if advanced {
            let max_depth = self.trie.limits().max_depth;
            let _ = flow
                .depth
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                    if d < max_depth {
                        Some(d + 1)
                    } else {
                        None
                    }
                });
        }
    }

    /// Called once per intake event; triggers an inline drain every `drain_every`
    /// events, and unconditionally on the first event observed from a given
    /// thread (so short-lived worker threads still make progress).
    pub fn note_event(&self) {
        let first_on_thread = THREAD_PRIMED.with(|primed| {
            let was_primed = primed.get();
            primed.set(true);
            !was_primed
        });
        let count = self.events_since_drain.fetch_add(1, Ordering::Relaxed) + 1;
        if first_on_thread || count >= self.drain_every {
            self.events_since_drain.store(0, Ordering::Relaxed);
            self.drain_gc_queue();
        }
    }

    /// Scans the active map for flows whose tracked object is no longer alive.
    /// Completed flows are removed silently; non-completed flows whose weak
    /// reference no longer upgrades are attributed a GC leak on their current node
    /// and then removed. Idempotent when nothing has changed since the last call.
    pub fn drain_gc_queue(&self) {
        let snapshot: Vec<(u64, Arc<WeakActiveFlow>)> = self
            .active
            .read()
            .iter()
            .map(|(id, flow)| (*id, flow.clone()))
            .collect();

        let mut to_remove = Vec::new();
        for (identity, flow) in &snapshot {
            if flow.completed() {
                to_remove.push(*identity);
                continue;
            }
            if !flow.is_alive() {
                flow.current_node().record_gc_leak();
                log::debug!("object {identity:#x} reclaimed without terminal release");
                to_remove.push(*identity);
            }
        }

        if !to_remove.is_empty() {
            let mut active = self.active.write();
            for identity in to_remove {
                active.remove(&identity);
            }
        }
    }

    /// On shutdown: every flow still active and not completed is attributed an
    /// end-of-life leak on its current node, then the map is cleared entirely.
    pub fn mark_remaining_as_leaks(&self) {
        let mut active = self.active.write();
        for flow in active.values() {
            if !flow.completed() {
                flow.current_node().record_eol_leak();
            }
        }
        active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ftrace_intern::StringInterner;

    struct Buffer;
    impl TrackedObject for Buffer {}

    fn tracker() -> (Arc<StringInterner>, WeakActiveTracker) {
        let interner = Arc::new(StringInterner::with_default_capacity());
        let trie = Arc::new(BoundedImprintTrie::with_default_limits(interner.clone()));
        let tracker = WeakActiveTracker::new(trie);
        (interner, tracker)
    }

    #[test]
    fn clean_release_marks_completed_and_records_on_current_node() {
        let (interner, tracker) = tracker();
        let obj: Arc<dyn TrackedObject> = Arc::new(Buffer);
        let flow = tracker.get_or_create(&obj, interner.intern("Alloc.direct"), true);
        tracker.record_clean_release(flow.obj_identity());
        assert!(flow.completed());
        assert_eq!(flow.current_node().clean_releases(), 1);
        // Idempotent.
        tracker.record_clean_release(flow.obj_identity());
        assert_eq!(flow.current_node().clean_releases(), 1);
    }

    #[test]
    fn gc_drain_detects_reclaimed_object_without_release() {
        let (interner, tracker) = tracker();
        let root_sig = interner.intern("Alloc.direct");
        let flow = {
            let obj: Arc<dyn TrackedObject> = Arc::new(Buffer);
            // `obj` drops at the end of this block; only the tracker's Weak remains.
            tracker.get_or_create(&obj, root_sig, true)
        };
        assert!(!flow.completed());
        tracker.drain_gc_queue();
        assert_eq!(flow.current_node().gc_leaks(), 1);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn drain_is_idempotent_when_queue_empty() {
        let (_interner, tracker) = tracker();
        tracker.drain_gc_queue();
        tracker.drain_gc_queue();
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn mark_remaining_as_leaks_on_shutdown() {
        let (interner, tracker) = tracker();
        let root_sig = interner.intern("Alloc.heap");
        let obj: Arc<dyn TrackedObject> = Arc::new(Buffer);
        let flow = tracker.get_or_create(&obj, root_sig, false);
        tracker.mark_remaining_as_leaks();
        assert_eq!(flow.current_node().end_of_life_leaks(), 1);
        assert_eq!(tracker.active_count(), 0);
    }
}
