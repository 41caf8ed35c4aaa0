//! The bounded imprint trie: a concurrent, memory-bounded prefix tree that
//! aggregates method-call paths across many tracked-object instances.

mod node;

pub use node::{ImprintNode, NodeKey, RefCountBucket, PER_NODE_CAP};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use fnv::FnvHashMap;
use ftrace_intern::{MethodSignature, StringInterner};
use parking_lot::RwLock;

/// Default global cap on live nodes across every root.
pub const DEFAULT_MAX_TOTAL_NODES: u64 = 1_000_000;
/// Default cap on path depth from any root.
pub const DEFAULT_MAX_DEPTH: u16 = 100;

/// The label given to the designated overflow root once the global node cap is
/// reached and a genuinely new allocation site shows up (§9 open question: this
/// spec fixes the label and treats its contents as opaque).
pub const OVERFLOW_LABEL: &str = "OVERFLOW";

#[derive(Clone, Copy, Debug)]
pub struct TrieLimits {
    pub max_total_nodes: u64,
    pub max_depth: u16,
    pub per_node_cap: usize,
}

impl Default for TrieLimits {
    fn default() -> Self {
        TrieLimits {
            max_total_nodes: DEFAULT_MAX_TOTAL_NODES,
            max_depth: DEFAULT_MAX_DEPTH,
            per_node_cap: PER_NODE_CAP,
        }
    }
}

/// Owns the roots of the flow trie, enforces the global node cap, and creates or
/// looks up child nodes on behalf of callers. Every mutation is either an
/// insert-if-absent on a concurrent map or a relaxed atomic increment; nothing here
/// blocks on anything but brief lock contention.
pub struct BoundedImprintTrie {
    interner: Arc<StringInterner>,
    roots: RwLock<FnvHashMap<MethodSignature, Arc<ImprintNode>>>,
    node_count: AtomicU64,
    overflow_root: RwLock<Option<Arc<ImprintNode>>>,
    limits: TrieLimits,
}

impl BoundedImprintTrie {
    pub fn new(interner: Arc<StringInterner>, limits: TrieLimits) -> Self {
        BoundedImprintTrie {
            interner,
            roots: RwLock::new(FnvHashMap::default()),
            node_count: AtomicU64::new(0),
            overflow_root: RwLock::new(None),
            limits,
        }
    }

    pub fn with_default_limits(interner: Arc<StringInterner>) -> Self {
        Self::new(interner, TrieLimits::default())
    }

    pub fn limits(&self) -> TrieLimits {
        self.limits
    }

    pub fn node_count(&self) -> u64 {
        self.node_count.load(Ordering::Relaxed)
    }

    pub fn root_count(&self) -> usize {
        self.roots.read().len()
    }

    /// Atomically checks the global node cap and, if room remains, claims a slot.
    /// Must be called at most once per node actually created.
    fn try_claim_node_slot(&self) -> bool {
        self.node_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                if n < self.limits.max_total_nodes {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Returns the root for `sig`, creating it if the global cap allows. Once the
    /// cap is reached, new allocation sites collapse into a single designated
    /// overflow root (documented overflow policy, §4.3/§9).
    pub fn get_or_create_root(&self, sig: MethodSignature) -> Arc<ImprintNode> {
        self.get_or_create_root_with(sig, false)
    }

    pub fn get_or_create_root_with(&self, sig: MethodSignature, is_direct: bool) -> Arc<ImprintNode> {
        if let Some(existing) = self.roots.read().get(&sig) {
            existing.record_traversal();
            return existing.clone();
        }

        let mut roots = self.roots.write();
        if let Some(existing) = roots.get(&sig) {
            existing.record_traversal();
            return existing.clone();
        }

        if !self.try_claim_node_slot() {
            drop(roots);
            let overflow = self.overflow_root();
            overflow.record_traversal();
            return overflow;
        }

        let root = ImprintNode::new_root(sig.clone(), is_direct);
        root.record_traversal();
        roots.insert(sig, root.clone());
        root
    }

    fn overflow_root(&self) -> Arc<ImprintNode> {
        if let Some(existing) = self.overflow_root.read().as_ref() {
            return existing.clone();
        }
        let mut slot = self.overflow_root.write();
        if let Some(existing) = slot.as_ref() {
            return existing.clone();
        }
        let sig = self.interner.intern(OVERFLOW_LABEL);
        // The overflow root itself must not be subject to the cap check it exists
        // to absorb traffic for, but it is still a live node and must be counted:
        // bypass the check, not the counter.
        self.node_count.fetch_add(1, Ordering::Relaxed);
        let root = ImprintNode::new_root(sig.clone(), false);
        self.roots.write().insert(sig, root.clone());
        *slot = Some(root.clone());
        root
    }

    /// Returns the child of `parent` keyed by `(sig, ref_bucket)`, subject to the
    /// per-node cap, the global node cap, and the max-depth cap. See
    /// `ImprintNode::get_or_create_child` for the stop-on-limit contract.
    pub fn get_or_create_child(
        &self,
        parent: &Arc<ImprintNode>,
        sig: MethodSignature,
        ref_bucket: RefCountBucket,
    ) -> Arc<ImprintNode> {
        let max_depth = self.limits.max_depth;
        let per_node_cap = self.limits.per_node_cap;
        let child = parent.get_or_create_child(
            sig,
            ref_bucket,
            || self.try_claim_node_slot(),
            max_depth,
            per_node_cap,
        );
        child.record_traversal();
        child
    }

    /// Snapshot iteration of roots (including the overflow root, if materialized).
    pub fn iter_roots(&self) -> Vec<Arc<ImprintNode>> {
        self.roots.read().values().cloned().collect()
    }

    /// Clears all state. Test-only: node ids (root/child identities) are never
    /// reused outside of `reset`.
    pub fn reset(&self) {
        self.roots.write().clear();
        *self.overflow_root.write() = None;
        self.node_count.store(0, Ordering::Relaxed);
    }
}
