//! `ftrace`: the public surface instrumentation authors actually depend on.
//!
//! Wires together the sub-crates described in spec §2 -- `ftrace-intern`,
//! `ftrace-trie`, `ftrace-tracker`, `ftrace-config`, `ftrace-engine`, and
//! `ftrace-metrics` -- behind one facade, and owns the only process-wide
//! singleton in the system (§9 "Global singletons"): a `FlowEngineHandle`
//! installed once at startup, with an independent-instance factory for tests
//! that never touches the process-wide cell.

use std::sync::Arc;
use std::time::Duration;

pub use ftrace_config::{FlowConfig, NodeLimits};
pub use ftrace_engine::{
    EngineStatsSnapshot, FlowEngine, InvocationScope, ObjectKindDescriptor, TrackedObject, DEFAULT_KIND,
};
pub use ftrace_intern::{MethodSignature, StringInterner};
pub use ftrace_metrics::{HandlerRegistry, LeakRecord, MetricHandler, MetricPayload, MetricSnapshot, MetricType};
pub use ftrace_trie::{BoundedImprintTrie, ImprintNode, RefCountBucket};
pub use ftrace_tracker::{WeakActiveFlow, WeakActiveTracker};

use ftrace_metrics::MetricScheduler;

/// The process-wide routing handle: one `FlowEngine`, one `HandlerRegistry`, and
/// the background scheduler pumping snapshots between them. Everything past
/// `install`/`new_standalone` is immutable; handlers are the only thing that
/// still mutates (via the registry's own interior copy-on-write list).
pub struct FlowEngineHandle {
    engine: Arc<FlowEngine>,
    registry: Arc<HandlerRegistry>,
    scheduler: Option<MetricScheduler>,
}

impl FlowEngineHandle {
    /// Builds a handle and installs its engine as the process-wide instance
    /// (§9: "explicit constructor at startup; thereafter immutable routing
    /// handle"). Installing twice in the same process is a no-op past the
    /// first call -- `FlowEngine::install` only ever sets the cell once -- so
    /// repeated calls are harmless but only the first handle's scheduler is
    /// the one actually reachable via `FlowEngine::process_wide()`.
    pub fn install(config: FlowConfig) -> FlowEngineHandle {
        let push_interval = config.push_interval;
        let engine = FlowEngine::install(FlowEngine::new_standalone(config));
        Self::with_engine(engine, push_interval)
    }

    /// Builds an independent handle that never touches the process-wide cell.
    /// This is what tests should use (§9: "Tests take an independent instance
    /// via a factory that does not touch the process-wide handle.").
    pub fn new_standalone(config: FlowConfig) -> FlowEngineHandle {
        let push_interval = config.push_interval;
        let engine = FlowEngine::new_standalone(config);
        Self::with_engine(engine, push_interval)
    }

    fn with_engine(engine: Arc<FlowEngine>, push_interval: Duration) -> FlowEngineHandle {
        let registry = Arc::new(HandlerRegistry::new());
        let scheduler = MetricScheduler::start(engine.clone(), registry.clone(), push_interval);
        FlowEngineHandle {
            engine,
            registry,
            scheduler: Some(scheduler),
        }
    }

    pub fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn register_handler(&self, handler: Arc<dyn MetricHandler>) {
        self.registry.register(handler);
    }

    pub fn unregister_handler(&self, name: &str) {
        self.registry.unregister(name);
    }

    /// Engine shutdown (§4.7): marks remaining flows as end-of-life leaks,
    /// delivers one final snapshot synchronously, then stops the pump thread.
    pub fn shutdown(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Buffer;
    impl TrackedObject for Buffer {}

    #[test]
    fn standalone_handle_never_touches_process_wide_cell() {
        let before = FlowEngine::process_wide().is_some();
        let handle = FlowEngineHandle::new_standalone(FlowConfig::default());
        let obj: Arc<dyn TrackedObject> = Arc::new(Buffer);
        handle.engine().on_construction(&obj, DEFAULT_KIND, "Alloc.direct", true);
        assert_eq!(FlowEngine::process_wide().is_some(), before, "standalone must not install globally");
        handle.shutdown();
    }
}
