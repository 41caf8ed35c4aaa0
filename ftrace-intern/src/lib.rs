//! A fixed-capacity interner for method-call-path signatures.
//!
//! The flow trie keys its children by `(signature identity, ref bucket)`, so two
//! equal signature strings need to compare and hash cheaply. This crate hands out
//! `MethodSignature`s backed by a shared `Arc<str>`: when two callers intern the
//! same text while the pool still has room, they get back clones of the very same
//! allocation, so the common-case comparison is a pointer check. Once the pool is
//! full, further distinct strings are still handed back as valid `MethodSignature`s
//! (just not canonicalized), and comparisons for those fall back to string equality.
//! Correctness never depends on interning succeeding; only the hot path does.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::RwLock;

/// An interned (or, past capacity, merely heap-allocated) method-call-path string,
/// of the form `ClassSimpleName.methodName`.
#[derive(Clone)]
pub struct MethodSignature(Arc<str>);

impl MethodSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True identity equality, ignoring the value-equality fallback used once the
    /// interner is saturated. Useful for callers that want to assert canonicalization
    /// actually happened (mostly tests).
    pub fn is_same_allocation(&self, other: &MethodSignature) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl PartialEq for MethodSignature {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for MethodSignature {}

impl Hash for MethodSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Must hash on value, not pointer: two MethodSignatures can be value-equal
        // without being the same allocation once the interner has degraded.
        self.0.hash(state);
    }
}

/// Default bound on distinct strings the interner will canonicalize.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// Thread-safe, fixed-capacity string interner. Never evicts; once a string is
/// canonicalized it stays canonical for the life of the process.
pub struct StringInterner {
    capacity: usize,
    pool: RwLock<FnvHashMap<Box<str>, Arc<str>>>,
}

impl StringInterner {
    pub fn new(capacity: usize) -> Self {
        StringInterner {
            capacity,
            pool: RwLock::new(FnvHashMap::default()),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    pub fn len(&self) -> usize {
        self.pool.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a canonical `MethodSignature` for `s`. Degrades gracefully (returns
    /// an un-canonicalized signature) once `capacity` distinct strings have been
    /// interned.
    pub fn intern(&self, s: &str) -> MethodSignature {
        self.intern_reporting(s).0
    }

    /// Same as `intern`, but also reports whether this call degraded -- i.e. `s`
    /// was not already canonicalized and the pool was at capacity. Callers that
    /// need to account for the interner-cap case of a limit-reached event use
    /// this instead of `intern`.
    pub fn intern_reporting(&self, s: &str) -> (MethodSignature, bool) {
        // Fast path: already interned.
        if let Some(existing) = self.pool.read().get(s) {
            return (MethodSignature(existing.clone()), false);
        }

        let mut pool = self.pool.write();
        // Another writer may have beaten us to it between the read and write locks.
        if let Some(existing) = pool.get(s) {
            return (MethodSignature(existing.clone()), false);
        }
        if pool.len() >= self.capacity {
            log::debug!("string interner at capacity {}, degrading for {s:?}", self.capacity);
            return (MethodSignature(Arc::from(s)), true);
        }
        let canonical: Arc<str> = Arc::from(s);
        pool.insert(Box::from(s), canonical.clone());
        (MethodSignature(canonical), false)
    }
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
