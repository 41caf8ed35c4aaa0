//! `FlowEngine`: the public intake API consumed by instrumentation (§4.5/§6).
//! Routes construction, method-call, and terminal-release events into the active
//! map and the imprint trie. Never fails outward; every internal failure mode is
//! absorbed into a counter on `EngineStats`.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use fnv::FnvHashSet;
use ftrace_config::FlowConfig;
use ftrace_intern::StringInterner;
use ftrace_trie::{BoundedImprintTrie, RefCountBucket, TrieLimits};
use ftrace_tracker::{TrackedObject, WeakActiveFlow, WeakActiveTracker};
use parking_lot::RwLock;

pub use ftrace_tracker::TrackedObject as ObjectKind;

/// The kind name always implicitly tracked, with no registration required (§6:
/// "the default kind is the native buffer type").
pub const DEFAULT_KIND: &str = "native_buffer";

/// A predicate-backed descriptor for a non-default object kind (§9: "a capability
/// set ... via a tagged descriptor registry").
#[derive(Clone)]
pub struct ObjectKindDescriptor {
    pub name: String,
    predicate: Arc<dyn Fn(&dyn TrackedObject) -> bool + Send + Sync>,
}

impl ObjectKindDescriptor {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&dyn TrackedObject) -> bool + Send + Sync + 'static,
    ) -> Self {
        ObjectKindDescriptor {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }
}

/// Per-invocation dedup set, supplied by the instrumentation as a stack-local hash
/// (or derived inline): ensures a method invocation touching the same tracked
/// object more than once (a parameter passed twice, a parameter equal to `this`)
/// collapses to a single traversal.
#[derive(Default)]
pub struct InvocationScope {
    seen: RefCell<FnvHashSet<u64>>,
}

impl InvocationScope {
    pub fn new() -> Self {
        InvocationScope::default()
    }

    /// Returns true the first time `identity` is seen in this scope.
    fn mark_seen(&self, identity: u64) -> bool {
        self.seen.borrow_mut().insert(identity)
    }
}

/// Best-effort internal failure counters (§5/§7): none of these ever become an
/// error the caller sees.
#[derive(Default)]
pub struct EngineStats {
    dropped_events: AtomicU64,
    limit_hits: AtomicU64,
    reentrant_drops: AtomicU64,
    direct_only_skips: AtomicU64,
    unknown_kind_rejections: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStatsSnapshot {
    pub dropped_events: u64,
    pub limit_hits: u64,
    pub reentrant_drops: u64,
    pub direct_only_skips: u64,
    pub unknown_kind_rejections: u64,
}

impl EngineStats {
    fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            limit_hits: self.limit_hits.load(Ordering::Relaxed),
            reentrant_drops: self.reentrant_drops.load(Ordering::Relaxed),
            direct_only_skips: self.direct_only_skips.load(Ordering::Relaxed),
            unknown_kind_rejections: self.unknown_kind_rejections.load(Ordering::Relaxed),
        }
    }
}

thread_local! {
    static REENTRANCY_GUARD: Cell<bool> = const { Cell::new(false) };
}

/// RAII re-entrancy guard (§5/§9): an intake call that transitively triggers
/// another intake call on the same thread is a silent no-op. Held for the
/// duration of one public `FlowEngine` method.
struct ReentrancyGuard {
    acquired: bool,
}

impl ReentrancyGuard {
    fn try_acquire() -> ReentrancyGuard {
        let acquired = REENTRANCY_GUARD.with(|g| {
            if g.get() {
                false
            } else {
                g.set(true);
                true
            }
        });
        ReentrancyGuard { acquired }
    }

    fn acquired(&self) -> bool {
        self.acquired
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        if self.acquired {
            REENTRANCY_GUARD.with(|g| g.set(false));
        }
    }
}

/// The flow-trace engine: owns the interner, the trie, and the active-flow
/// tracker, and exposes the intake surface instrumentation calls into.
pub struct FlowEngine {
    interner: Arc<StringInterner>,
    trie: Arc<BoundedImprintTrie>,
    tracker: WeakActiveTracker,
    config: FlowConfig,
    kinds: RwLock<Vec<ObjectKindDescriptor>>,
    stats: EngineStats,
}

static PROCESS_WIDE: OnceLock<Arc<FlowEngine>> = OnceLock::new();

impl FlowEngine {
    /// Builds an independent engine instance, touching no process-wide state.
    /// Intended for tests and for embedders that manage their own lifetime.
    pub fn new_standalone(config: FlowConfig) -> Arc<FlowEngine> {
        let interner = Arc::new(StringInterner::new(config.interner_capacity));
        let trie_limits = TrieLimits {
            max_total_nodes: config.node_limits.max_total_nodes,
            max_depth: config.depth_limit,
            per_node_cap: config.node_limits.per_node_cap,
        };
        let trie = Arc::new(BoundedImprintTrie::new(interner.clone(), trie_limits));
        let tracker = WeakActiveTracker::new(trie.clone());
        Arc::new(FlowEngine {
            interner,
            trie,
            tracker,
            config,
            kinds: RwLock::new(Vec::new()),
            stats: EngineStats::default(),
        })
    }

    /// Installs `engine` as the process-wide instance. May only succeed once;
    /// later calls are no-ops (the process-wide handle is immutable once routed).
    pub fn install(engine: Arc<FlowEngine>) -> Arc<FlowEngine> {
        let _ = PROCESS_WIDE.set(engine);
        PROCESS_WIDE.get().expect("just set").clone()
    }

    /// Returns the process-wide instance, if one has been installed.
    pub fn process_wide() -> Option<Arc<FlowEngine>> {
        PROCESS_WIDE.get().cloned()
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn trie(&self) -> &Arc<BoundedImprintTrie> {
        &self.trie
    }

    pub fn tracker(&self) -> &WeakActiveTracker {
        &self.tracker
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Registers a non-default object kind's tracking predicate (§6). The default
    /// kind, `DEFAULT_KIND`, is always tracked and needs no registration.
    pub fn register_object_kind(&self, descriptor: ObjectKindDescriptor) {
        self.kinds.write().push(descriptor);
    }

    fn kind_allows(&self, kind: &str, obj: &dyn TrackedObject) -> bool {
        if kind == DEFAULT_KIND {
            return true;
        }
        match self.kinds.read().iter().find(|d| d.name == kind) {
            Some(descriptor) => (descriptor.predicate)(obj),
            None => false,
        }
    }

    /// Called when a tracked object is born (§4.5). Ignored if a flow already
    /// exists for this identity (at-most-once root), if `kind` is unregistered, or
    /// if `filter_direct_only` skips this heap-only allocation site.
    pub fn on_construction(
        &self,
        obj: &Arc<dyn TrackedObject>,
        kind: &str,
        allocation_site_sig: &str,
        is_direct: bool,
    ) {
        let guard = ReentrancyGuard::try_acquire();
        if !guard.acquired() {
            self.stats.reentrant_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.tracker.note_event();

        if !self.kind_allows(kind, obj.as_ref()) {
            self.stats.unknown_kind_rejections.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.tracker.get(obj.identity()).is_some() {
            return; // at-most-once root
        }

        if self.config.filter_direct_only {
            let allow = match self.config.direct_only_fast_path(allocation_site_sig) {
                Some(decision) => decision,
                None => obj.is_direct(),
            };
            if !allow {
                self.stats.direct_only_skips.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let root_sig = self.interner.intern(allocation_site_sig);
        self.tracker.get_or_create(obj, root_sig, is_direct);
    }

    /// Advances the flow into a child keyed by `(method_sig, bucketize(observed_refcount))`.
    /// If no flow exists yet (instrumentation entered a method with an object that
    /// was never seen at construction), a lazy root keyed by `method_sig` is
    /// created instead (§4.5).
    pub fn on_method_enter(
        &self,
        obj: &Arc<dyn TrackedObject>,
        method_sig: &str,
        observed_refcount: u32,
        invocation: Option<&InvocationScope>,
    ) {
        let guard = ReentrancyGuard::try_acquire();
        if !guard.acquired() {
            self.stats.reentrant_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(scope) = invocation {
            if !scope.mark_seen(obj.identity()) {
                return; // duplicate parameter within the same invocation
            }
        }

        self.tracker.note_event();
        let bucket = RefCountBucket::bucketize(observed_refcount);
        let sig = self.interner.intern(method_sig);

        match self.tracker.get(obj.identity()) {
            Some(flow) => self.tracker.advance(&flow, sig, bucket),
            None => {
                self.tracker.get_or_create(obj, sig, obj.is_direct());
            }
        }
    }

    /// Advances the flow using `method_sig + "_return"`. If no flow exists yet,
    /// lazily roots one at the bare `method_sig` -- mirroring `on_method_enter`'s
    /// lazy-root fallback -- then advances into the `_return` child as usual.
    pub fn on_method_exit(
        &self,
        obj: &Arc<dyn TrackedObject>,
        method_sig: &str,
        observed_refcount: u32,
        invocation: Option<&InvocationScope>,
    ) {
        let guard = ReentrancyGuard::try_acquire();
        if !guard.acquired() {
            self.stats.reentrant_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(scope) = invocation {
            if !scope.mark_seen(obj.identity()) {
                return;
            }
        }

        self.tracker.note_event();
        let bucket = RefCountBucket::bucketize(observed_refcount);
        let exit_sig = format!("{method_sig}_return");
        let sig = self.interner.intern(&exit_sig);

        match self.tracker.get(obj.identity()) {
            Some(flow) => self.tracker.advance(&flow, sig, bucket),
            None => {
                // Root at the bare entry signature, matching `on_method_enter`'s
                // lazy-root fallback, then advance into the `_return` child as usual.
                let root_sig = self.interner.intern(method_sig);
                let flow = self.tracker.get_or_create(obj, root_sig, obj.is_direct());
                self.tracker.advance(&flow, sig, bucket);
            }
        }
    }

    /// Called only once the terminal release has been confirmed externally
    /// (observed refcount zero). Subsequent calls for the same identity are
    /// idempotent no-ops (`WeakActiveTracker::record_clean_release` itself is
    /// idempotent).
    pub fn on_terminal_release(&self, obj: &Arc<dyn TrackedObject>, site_sig: &str) {
        let guard = ReentrancyGuard::try_acquire();
        if !guard.acquired() {
            self.stats.reentrant_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.tracker.note_event();

        let sig = self.interner.intern(site_sig);
        let flow = match self.tracker.get(obj.identity()) {
            Some(flow) => flow,
            None => self.tracker.get_or_create(obj, sig.clone(), obj.is_direct()),
        };
        self.tracker.advance(&flow, sig, RefCountBucket::Zero);
        self.tracker.record_clean_release(obj.identity());
    }

    /// Returns a clone of the flow for `obj`, mostly useful for tests that want to
    /// assert on trie state reached by a given object without re-deriving it.
    pub fn flow_for(&self, obj: &Arc<dyn TrackedObject>) -> Option<Arc<WeakActiveFlow>> {
        self.tracker.get(obj.identity())
    }

    /// Shutdown: attributes every still-active, non-completed flow as an
    /// end-of-life leak, then clears the active map. Callers building a final
    /// snapshot should do so only after calling this.
    pub fn shutdown(&self) {
        self.tracker.mark_remaining_as_leaks();
    }

    /// Runs `f` under the same thread-local re-entrancy guard intake calls use.
    /// `ftrace-metrics`'s snapshot builder and dispatch loop wrap themselves in
    /// this so that a handler which, from `on_metrics`, calls back into an intake
    /// method on the same (scheduler) thread is treated exactly like any other
    /// re-entrant intake call: a silent no-op counted under `reentrant_drops`,
    /// never a recursive walk of the trie it is already walking (§8 scenario 6).
    pub fn run_exclusive<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let guard = ReentrancyGuard::try_acquire();
        if !guard.acquired() {
            self.stats.reentrant_drops.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(f())
    }
}
