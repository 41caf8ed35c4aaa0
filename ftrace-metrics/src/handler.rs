//! `HandlerRegistry`: the copy-on-write list of metric consumers the scheduler
//! dispatches to (§4.7/§6 Handler contract).

use std::sync::Arc;

use fnv::FnvHashSet;
use parking_lot::RwLock;

use crate::snapshot::{MetricSnapshot, MetricType};

/// A consumer of periodic metric snapshots. Implementors declare which
/// `MetricType`s they care about; the scheduler only ever shows them those.
/// `on_metrics` must be non-blocking and fast (§4.7): a slow handler delays
/// subsequent pushes but never aborts the scheduler, and a panicking handler is
/// caught and recorded rather than allowed to take the pump thread down with it.
pub trait MetricHandler: Send + Sync {
    fn required_metrics(&self) -> FnvHashSet<MetricType>;
    fn on_metrics(&self, snapshot: &MetricSnapshot);
    fn name(&self) -> &str;
}

/// Rare-write, frequent-read registry of handlers (§5: "copy-on-write list;
/// updates are rare"), the same `RwLock<Vec<_>>` shape `ftrace-engine`'s kind
/// registry uses.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn MetricHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        HandlerRegistry::default()
    }

    pub fn register(&self, handler: Arc<dyn MetricHandler>) {
        self.handlers.write().push(handler);
    }

    pub fn unregister(&self, name: &str) {
        self.handlers.write().retain(|h| h.name() != name);
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The union of every registered handler's declared interest; this is what
    /// the scheduler builds a single shared snapshot against before splitting it
    /// back out per handler (§4.7: "the union of currently registered handlers").
    pub fn union_of_interests(&self) -> FnvHashSet<MetricType> {
        self.handlers
            .read()
            .iter()
            .flat_map(|h| h.required_metrics())
            .collect()
    }

    pub fn snapshot_handlers(&self) -> Vec<Arc<dyn MetricHandler>> {
        self.handlers.read().clone()
    }

    /// Dispatches `full` to every registered handler, restricted to each
    /// handler's own declared interest. Panics inside a handler are caught so one
    /// bad handler can never stop delivery to the rest, or to the next pump.
    pub fn dispatch(&self, full: &MetricSnapshot) {
        for handler in self.snapshot_handlers() {
            let interest = handler.required_metrics();
            let view = full.restrict_to(&interest);
            let name = handler.name().to_string();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.on_metrics(&view);
            }));
            if let Err(_panic) = result {
                log::warn!("metric handler {name:?} panicked while processing a snapshot");
            }
        }
    }
}
