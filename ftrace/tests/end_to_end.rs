//! Literal end-to-end scenarios from spec §8, seeded verbatim as the facade's
//! integration test suite since they exercise the public composition of every
//! sub-crate rather than one crate's internals (SPEC_FULL.md §E).

use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashSet;
use ftrace::{
    FlowConfig, FlowEngine, FlowEngineHandle, InvocationScope, MetricHandler, MetricSnapshot, MetricType,
    NodeLimits, ObjectKindDescriptor, TrackedObject, DEFAULT_KIND,
};
use ftrace_metrics::{build_and_dispatch, MetricSnapshotBuilder};

struct Buffer {
    direct: bool,
}

impl TrackedObject for Buffer {
    fn is_direct(&self) -> bool {
        self.direct
    }
}

fn all_metric_types() -> FnvHashSet<MetricType> {
    MetricType::all().into_iter().collect()
}

/// Scenario 1: clean direct-buffer flow.
#[test]
fn clean_direct_buffer_flow() {
    let engine = FlowEngine::new_standalone(FlowConfig::default());
    let b: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });

    engine.on_construction(&b, DEFAULT_KIND, "Alloc.direct", true);
    engine.on_method_enter(&b, "Svc.process", 1, None);
    engine.on_method_exit(&b, "Svc.process", 1, None);
    engine.on_terminal_release(&b, "Svc.process");

    let flow = engine.flow_for(&b).unwrap();
    assert!(flow.completed());
    let leaf = flow.current_node();
    assert_eq!(leaf.signature.as_str(), "Svc.process");
    assert_eq!(leaf.ref_bucket.as_u8(), 0);
    assert_eq!(leaf.clean_releases(), 1);
    assert_eq!(leaf.gc_leaks(), 0);

    let snapshot = MetricSnapshotBuilder::new(engine).build_snapshot(&all_metric_types());
    assert_eq!(snapshot.get(MetricType::DirectLeaks).unwrap().total, 0);
}

/// Scenario 2: direct-buffer leak discovered by GC.
#[test]
fn direct_buffer_leak_by_gc() {
    let engine = FlowEngine::new_standalone(FlowConfig::default());
    {
        let b: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
        engine.on_construction(&b, DEFAULT_KIND, "Alloc.direct", true);
        engine.on_method_enter(&b, "Svc.process", 1, None);
        engine.on_method_exit(&b, "Svc.process", 1, None);
        // `b` drops here: no terminal release was ever observed.
    }
    engine.tracker().drain_gc_queue();

    let snapshot = MetricSnapshotBuilder::new(engine).build_snapshot(&all_metric_types());
    let direct = snapshot.get(MetricType::DirectLeaks).unwrap();
    assert_eq!(direct.total, 1);
    assert_eq!(direct.records.len(), 1);
    assert!(direct.records[0].flow_repr.ends_with("Svc.process_return[ref=1]"));
    assert!(direct.records[0].flow_repr.contains("leak_count=1"));
}

/// Scenario 3: heap-buffer leak discovered only at shutdown.
#[test]
fn heap_buffer_leak_at_shutdown() {
    let engine = FlowEngine::new_standalone(FlowConfig::default());
    let h: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: false });
    engine.on_construction(&h, DEFAULT_KIND, "Alloc.heap", false);
    engine.on_method_enter(&h, "Parser.parse", 1, None);

    engine.shutdown();

    let snapshot = MetricSnapshotBuilder::new(engine).build_snapshot(&all_metric_types());
    let heap = snapshot.get(MetricType::HeapLeaks).unwrap();
    assert_eq!(heap.total, 1);
    let leaf = &heap.records[0];
    assert!(leaf.flow_repr.contains("leak_count=1"));
}

/// Scenario 4: two objects on an identical class/method path but differing
/// observed refcounts produce sibling leaves, not a merged one.
#[test]
fn refcount_anomaly_produces_sibling_leaves() {
    let engine = FlowEngine::new_standalone(FlowConfig::default());

    let a: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
    engine.on_construction(&a, DEFAULT_KIND, "Alloc.direct", true);
    engine.on_method_enter(&a, "Svc.process", 1, None);

    let b: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
    engine.on_construction(&b, DEFAULT_KIND, "Alloc.direct", true);
    engine.on_method_enter(&b, "Svc.process", 2, None);

    let leaf_a = engine.flow_for(&a).unwrap().current_node();
    let leaf_b = engine.flow_for(&b).unwrap().current_node();
    assert!(!Arc::ptr_eq(&leaf_a, &leaf_b));
    assert_eq!(leaf_a.ref_bucket.as_u8(), 1);
    assert_eq!(leaf_b.ref_bucket.as_u8(), 2);

    let root = engine.trie().iter_roots().into_iter().find(|r| r.signature.as_str() == "Alloc.direct").unwrap();
    assert_eq!(root.child_count(), 2);
}

/// Scenario 5: limit absorption. With `per_node_cap` configured to 4, a fifth
/// distinct child under the same parent is absorbed as a self-traversal.
#[test]
fn limit_absorption_on_per_node_cap() {
    let config = FlowConfig {
        node_limits: NodeLimits {
            per_node_cap: 4,
            ..NodeLimits::default()
        },
        ..FlowConfig::default()
    };
    let engine = FlowEngine::new_standalone(config);
    let root_obj: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
    engine.on_construction(&root_obj, DEFAULT_KIND, "Alloc.direct", true);

    for i in 0..4 {
        let obj: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
        engine.on_construction(&obj, DEFAULT_KIND, "Alloc.direct", true);
        engine.on_method_enter(&obj, &format!("Step.{i}"), 1, None);
    }
    let root = engine.trie().iter_roots().into_iter().find(|r| r.signature.as_str() == "Alloc.direct").unwrap();
    assert_eq!(root.child_count(), 4);
    let traversals_before = root.traversals();

    let fifth: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
    engine.on_construction(&fifth, DEFAULT_KIND, "Alloc.direct", true);
    engine.on_method_enter(&fifth, "Step.4", 1, None);

    assert_eq!(root.child_count(), 4, "a fifth distinct child must not be created");
    assert_eq!(root.traversals(), traversals_before + 1);
    let fifth_flow_leaf = engine.flow_for(&fifth).unwrap().current_node();
    assert!(Arc::ptr_eq(&fifth_flow_leaf, &root), "absorbed step must leave the flow on the parent");
}

/// Scenario 6: re-entrancy guard. A handler that, from `on_metrics`, issues an
/// intake call on the same thread must be a no-op: no state changes, no
/// recursive walk of the trie it is already walking.
#[test]
fn reentrant_intake_from_a_handler_is_a_no_op() {
    struct ReentrantHandler {
        obj: Arc<dyn TrackedObject>,
        engine: Arc<FlowEngine>,
    }
    impl MetricHandler for ReentrantHandler {
        fn required_metrics(&self) -> FnvHashSet<MetricType> {
            FnvHashSet::default()
        }
        fn on_metrics(&self, _snapshot: &MetricSnapshot) {
            self.engine.on_method_enter(&self.obj, "Svc.fromHandler", 1, None);
        }
        fn name(&self) -> &str {
            "reentrant"
        }
    }

    let handle = FlowEngineHandle::new_standalone(FlowConfig::default());
    let obj: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
    handle.engine().on_construction(&obj, DEFAULT_KIND, "Alloc.direct", true);

    handle.register_handler(Arc::new(ReentrantHandler {
        obj: obj.clone(),
        engine: handle.engine().clone(),
    }));

    let builder = MetricSnapshotBuilder::new(handle.engine().clone());
    let before_drops = handle.engine().stats().reentrant_drops;
    build_and_dispatch(&builder, handle.registry());

    assert_eq!(handle.engine().stats().reentrant_drops, before_drops + 1);
    let leaf = handle.engine().flow_for(&obj).unwrap().current_node();
    assert_eq!(leaf.signature.as_str(), "Alloc.direct", "the nested call must not have advanced the flow");

    handle.shutdown();
}

/// Registering a custom object kind gates construction on its predicate, and
/// unregistered kinds are ignored entirely, as required by §6/§7.
#[test]
fn custom_object_kind_descriptor_gates_tracking() {
    let engine = FlowEngine::new_standalone(FlowConfig::default());
    engine.register_object_kind(ObjectKindDescriptor::new("direct_only", |o| o.is_direct()));

    let heap: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: false });
    engine.on_construction(&heap, "direct_only", "Alloc.heap", false);
    assert!(engine.flow_for(&heap).is_none());

    let direct: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
    engine.on_construction(&direct, "direct_only", "Alloc.direct", true);
    assert!(engine.flow_for(&direct).is_some());
}

/// A scheduler with no handlers registered must not build a snapshot on its
/// periodic tick, and must still shut down cleanly.
#[tokio::test(flavor = "multi_thread")]
async fn handle_with_no_handlers_shuts_down_cleanly() {
    let handle = FlowEngineHandle::new_standalone(FlowConfig {
        push_interval: Duration::from_millis(10),
        ..FlowConfig::default()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.shutdown();
}

/// A single method invocation touching the same object twice (e.g. a
/// parameter equal to another parameter) collapses to a single traversal.
#[test]
fn duplicate_parameters_within_one_invocation_collapse() {
    let engine = FlowEngine::new_standalone(FlowConfig::default());
    let obj: Arc<dyn TrackedObject> = Arc::new(Buffer { direct: true });
    engine.on_construction(&obj, DEFAULT_KIND, "Alloc.direct", true);

    let scope = InvocationScope::new();
    engine.on_method_enter(&obj, "Svc.batch", 1, Some(&scope));
    engine.on_method_enter(&obj, "Svc.batch", 1, Some(&scope));

    let leaf = engine.flow_for(&obj).unwrap().current_node();
    assert_eq!(leaf.traversals(), 1);
}
