use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use fnv::FnvHashMap;
use ftrace_intern::MethodSignature;
use parking_lot::RwLock;

/// A 2-bit quantization of an externally observed refcount: 0 means "released to
/// zero", 1 and 2 are exact, and 3 means "3 or more". Coalesces high-refcount
/// traffic without losing the release-vs-retained distinction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u8)]
pub enum RefCountBucket {
    Zero = 0,
    One = 1,
    Two = 2,
    ManyOrMore = 3,
}

impl RefCountBucket {
    pub fn bucketize(observed_refcount: u32) -> RefCountBucket {
        match observed_refcount {
            0 => RefCountBucket::Zero,
            1 => RefCountBucket::One,
            2 => RefCountBucket::Two,
            _ => RefCountBucket::ManyOrMore,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for RefCountBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Identifies a child of a given node: the interned signature of the step plus the
/// refcount bucket observed at that step.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeKey {
    pub signature: MethodSignature,
    pub ref_bucket: RefCountBucket,
}

/// Per-node cap on distinct children; once reached the node stops accepting new
/// distinct children (§3 invariants).
pub const PER_NODE_CAP: usize = 1000;

/// A node of the flow trie. Signature and ref_bucket are fixed at construction;
/// children and counters are the only mutable parts, and both are safe to touch
/// from many threads concurrently without any node-external lock.
pub struct ImprintNode {
    pub signature: MethodSignature,
    pub ref_bucket: RefCountBucket,
    pub depth: u16,
    /// Set for allocation-site roots that are known (or tagged) to be off-heap.
    pub is_direct: bool,
    parent: Option<Weak<ImprintNode>>,
    children: RwLock<FnvHashMap<NodeKey, Arc<ImprintNode>>>,
    traversals: AtomicU64,
    clean_releases: AtomicU64,
    gc_leaks: AtomicU64,
    end_of_life_leaks: AtomicU64,
}

impl ImprintNode {
    pub(crate) fn new_root(signature: MethodSignature, is_direct: bool) -> Arc<ImprintNode> {
        Arc::new(ImprintNode {
            signature,
            ref_bucket: RefCountBucket::Zero,
            depth: 0,
            is_direct,
            parent: None,
            children: RwLock::new(FnvHashMap::default()),
            traversals: AtomicU64::new(0),
            clean_releases: AtomicU64::new(0),
            gc_leaks: AtomicU64::new(0),
            end_of_life_leaks: AtomicU64::new(0),
        })
    }

    fn new_child(
        parent: &Arc<ImprintNode>,
        signature: MethodSignature,
        ref_bucket: RefCountBucket,
    ) -> Arc<ImprintNode> {
        Arc::new(ImprintNode {
            signature,
            ref_bucket,
            depth: parent.depth.saturating_add(1),
            is_direct: parent.is_direct,
            parent: Some(Arc::downgrade(parent)),
            children: RwLock::new(FnvHashMap::default()),
            traversals: AtomicU64::new(0),
            clean_releases: AtomicU64::new(0),
            gc_leaks: AtomicU64::new(0),
            end_of_life_leaks: AtomicU64::new(0),
        })
    }

    pub fn parent(&self) -> Option<Arc<ImprintNode>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn record_traversal(&self) {
        self.traversals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clean_release(&self) {
        self.clean_releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gc_leak(&self) {
        self.gc_leaks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eol_leak(&self) {
        self.end_of_life_leaks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn traversals(&self) -> u64 {
        self.traversals.load(Ordering::Relaxed)
    }

    pub fn clean_releases(&self) -> u64 {
        self.clean_releases.load(Ordering::Relaxed)
    }

    pub fn gc_leaks(&self) -> u64 {
        self.gc_leaks.load(Ordering::Relaxed)
    }

    pub fn end_of_life_leaks(&self) -> u64 {
        self.end_of_life_leaks.load(Ordering::Relaxed)
    }

    pub fn leak_count(&self) -> u64 {
        self.gc_leaks() + self.end_of_life_leaks()
    }

    /// A node is a terminal outcome (a "leaf" for snapshot purposes) once it has
    /// recorded a clean release or a leak, or once it truly has no children.
    pub fn is_terminal_outcome(&self) -> bool {
        self.clean_releases() > 0 || self.gc_leaks() > 0 || self.end_of_life_leaks() > 0
    }

    pub fn has_children(&self) -> bool {
        !self.children.read().is_empty()
    }

    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Snapshot-only iteration; the returned `Vec` is a point-in-time copy, cheap
    /// to build because children are reference-counted, not cloned.
    pub fn children_iter(self: &Arc<Self>) -> Vec<Arc<ImprintNode>> {
        self.children.read().values().cloned().collect()
    }

    /// Returns the child keyed by `(sig, ref_bucket)`, creating it if absent and
    /// within both the per-node cap and the caller-supplied global cap. When a cap
    /// is hit, returns `self` instead (stop-on-limit): the step is absorbed as a
    /// self-traversal and the caller should record the traversal on the returned
    /// node, not create anything further.
    pub(crate) fn get_or_create_child(
        self: &Arc<Self>,
        signature: MethodSignature,
        ref_bucket: RefCountBucket,
        try_claim_global_slot: impl FnOnce() -> bool,
        max_depth: u16,
        per_node_cap: usize,
    ) -> Arc<ImprintNode> {
        let key = NodeKey { signature: signature.clone(), ref_bucket };

        if let Some(existing) = self.children.read().get(&key) {
            return existing.clone();
        }

        if self.depth >= max_depth {
            log::debug!("depth limit reached at {}, absorbing as self-traversal", self.signature);
            return self.clone();
        }

        let mut children = self.children.write();
        if let Some(existing) = children.get(&key) {
            return existing.clone();
        }
        if children.len() >= per_node_cap {
            log::debug!("per-node child cap reached at {}, absorbing as self-traversal", self.signature);
            return self.clone();
        }
        if !try_claim_global_slot() {
            log::debug!("global node cap reached, absorbing as self-traversal at {}", self.signature);
            return self.clone();
        }

        let child = ImprintNode::new_child(self, signature, ref_bucket);
        children.insert(key, child.clone());
        child
    }
}

impl std::fmt::Debug for ImprintNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImprintNode")
            .field("signature", &self.signature)
            .field("ref_bucket", &self.ref_bucket)
            .field("depth", &self.depth)
            .field("traversals", &self.traversals())
            .field("clean_releases", &self.clean_releases())
            .field("gc_leaks", &self.gc_leaks())
            .field("end_of_life_leaks", &self.end_of_life_leaks())
            .finish()
    }
}
