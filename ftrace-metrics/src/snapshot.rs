//! The metric vocabulary, the immutable snapshot payloads, and the DFS walk that
//! turns live trie state into them (§3 MetricSnapshot, §4.6 MetricSnapshotBuilder).

use std::sync::Arc;

use fnv::FnvHashMap;
use ftrace_engine::FlowEngine;
use ftrace_trie::ImprintNode;

/// The two metric families §4.6 distinguishes: allocations known (or tagged) to be
/// off-heap versus everything else. Disjoint by construction -- every root is
/// classified into exactly one, so the two payloads partition the reported leaks
/// (§8: "the snapshot payloads for disjoint MetricTypes partition the reported
/// leaks").
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum MetricType {
    DirectLeaks,
    HeapLeaks,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::DirectLeaks => "DIRECT_LEAKS",
            MetricType::HeapLeaks => "HEAP_LEAKS",
        }
    }

    pub fn all() -> [MetricType; 2] {
        [MetricType::DirectLeaks, MetricType::HeapLeaks]
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One leaked leaf, rendered as the compact LLM-oriented `flow_repr` grammar of
/// §6: `root=<sig>|final_ref=<n>|leak_count=<n>|leak_rate=<p>|path=<step> -> ...`.
#[derive(Clone, Debug, PartialEq)]
pub struct LeakRecord {
    pub flow_repr: String,
    pub leak_count: u64,
    pub capture_nanos: u64,
}

/// Per-`MetricType` payload: the individual leak records plus their summed total.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricPayload {
    pub records: Vec<LeakRecord>,
    pub total: u64,
}

/// An immutable capture of leak records for a set of requested metric types.
/// Counters backing it were read in a single DFS pass (§4.6: "logically
/// consistent within a single DFS pass, not across passes"); it never mutates
/// after construction.
#[derive(Clone, Debug, Default)]
pub struct MetricSnapshot {
    pub capture_nanos: u64,
    metrics: FnvHashMap<MetricType, MetricPayload>,
}

impl MetricSnapshot {
    pub fn get(&self, metric: MetricType) -> Option<&MetricPayload> {
        self.metrics.get(&metric)
    }

    pub fn metric_types(&self) -> impl Iterator<Item = &MetricType> {
        self.metrics.keys()
    }

    /// A restricted clone containing only the entries `interest` names; used by
    /// the scheduler so each handler sees only the metric types it declared
    /// (§4.7: "each handler sees only the types it requested; others are
    /// omitted").
    pub fn restrict_to(&self, interest: &fnv::FnvHashSet<MetricType>) -> MetricSnapshot {
        MetricSnapshot {
            capture_nanos: self.capture_nanos,
            metrics: self
                .metrics
                .iter()
                .filter(|(k, _)| interest.contains(k))
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }
}

fn now_nanos() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Walks the trie and renders `MetricSnapshot`s on demand. Holds no state of its
/// own beyond a handle to the engine it reads from.
pub struct MetricSnapshotBuilder {
    engine: Arc<FlowEngine>,
}

impl MetricSnapshotBuilder {
    pub fn new(engine: Arc<FlowEngine>) -> MetricSnapshotBuilder {
        MetricSnapshotBuilder { engine }
    }

    pub(crate) fn engine(&self) -> &Arc<FlowEngine> {
        &self.engine
    }

    /// Builds a snapshot covering exactly `requested`. Forces a GC-queue drain
    /// first so that leaks discovered only at capture time are reflected (§4.6
    /// step 1). Wrapped in the engine's re-entrancy guard so that a caller
    /// already inside a guarded pass on this thread gets an empty snapshot
    /// instead of recursing into the walk it is already running.
    pub fn build_snapshot(&self, requested: &fnv::FnvHashSet<MetricType>) -> MetricSnapshot {
        self.engine.run_exclusive(|| self.build_snapshot_inner(requested)).unwrap_or_default()
    }

    /// Same walk, without acquiring the guard itself -- for callers (the
    /// scheduler's pump, `build_and_dispatch`) that need the build and the
    /// subsequent handler dispatch to share a single guard acquisition (§8
    /// scenario 6: a handler's callback into the intake API must be caught as
    /// re-entrant, which only holds if guard and dispatch share one scope).
    pub(crate) fn build_snapshot_inner(&self, requested: &fnv::FnvHashSet<MetricType>) -> MetricSnapshot {
        self.engine.tracker().drain_gc_queue();

        let capture_nanos = now_nanos();
        let max_depth = self.engine.trie().limits().max_depth;
        let mut metrics = FnvHashMap::default();

        for &metric_type in MetricType::all().iter() {
            if !requested.contains(&metric_type) {
                continue;
            }
            let mut records = Vec::new();
            for root in self.engine.trie().iter_roots() {
                if classify(&root) != metric_type {
                    continue;
                }
                let mut path = Vec::new();
                walk(&root, &mut path, max_depth, capture_nanos, &mut records);
            }
            let total = records.iter().map(|r| r.leak_count).sum();
            metrics.insert(metric_type, MetricPayload { records, total });
        }

        MetricSnapshot { capture_nanos, metrics }
    }
}

/// `DIRECT_LEAKS` covers roots known (or tagged) to seed off-heap allocations;
/// everything else is `HEAP_LEAKS` (§4.6 step 2). `is_direct` is fixed at root
/// creation and inherited down the whole subtree, so checking it on any node in
/// the chain is equivalent to checking it on the root.
fn classify(root: &Arc<ImprintNode>) -> MetricType {
    if root.is_direct {
        MetricType::DirectLeaks
    } else {
        MetricType::HeapLeaks
    }
}

fn walk(
    node: &Arc<ImprintNode>,
    path: &mut Vec<Arc<ImprintNode>>,
    max_depth: u16,
    capture_nanos: u64,
    out: &mut Vec<LeakRecord>,
) {
    path.push(node.clone());

    let leak_count = node.leak_count();
    if node.is_terminal_outcome() && leak_count > 0 {
        out.push(LeakRecord {
            flow_repr: render_flow_repr(path, leak_count),
            leak_count,
            capture_nanos,
        });
    }

    if node.has_children() && (path.len() as u16) < max_depth {
        for child in node.children_iter() {
            walk(&child, path, max_depth, capture_nanos, out);
        }
    }

    path.pop();
}

fn render_flow_repr(path: &[Arc<ImprintNode>], leak_count: u64) -> String {
    let leaf = path.last().expect("path always has at least the root");
    let traversals_at_leaf = leaf.traversals().max(1);
    let leak_rate_pct = (leak_count as f64 / traversals_at_leaf as f64) * 100.0;

    let path_repr = path
        .iter()
        .map(|n| format!("{}[ref={}]", n.signature, n.ref_bucket.as_u8()))
        .collect::<Vec<_>>()
        .join(" -> ");

    format!(
        "root={}|final_ref={}|leak_count={}|leak_rate={:.1}%|path={}",
        path[0].signature,
        leaf.ref_bucket.as_u8(),
        leak_count,
        leak_rate_pct,
        path_repr,
    )
}
