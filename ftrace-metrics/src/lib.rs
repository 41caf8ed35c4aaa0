//! Snapshot rendering and scheduled delivery: the last two stages of the
//! dataflow in spec §2 (`MetricSnapshotBuilder`, `MetricScheduler`,
//! `HandlerRegistry`).

mod handler;
mod scheduler;
mod snapshot;

pub use handler::{HandlerRegistry, MetricHandler};
pub use scheduler::{build_and_dispatch, MetricScheduler};
pub use snapshot::{LeakRecord, MetricPayload, MetricSnapshot, MetricSnapshotBuilder, MetricType};
