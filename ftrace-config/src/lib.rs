//! The configuration contract consumed once at `FlowEngine` startup (§6). Parsing
//! the class-pattern include/exclude sets and deciding which constructors count as
//! method entries is the instrumentation's job; this crate only owns the shape of
//! the contract and its (de)serialization, the way the reference workspace's own
//! options crate owns shapes without owning the file-watching loader around them.

use std::time::Duration;

use serde::Deserialize;

/// Distinct limits mirrored here from `ftrace-trie`/`ftrace-tracker` so that a
/// config file can drive them without those crates depending on serde.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeLimits {
    pub max_total_nodes: u64,
    pub per_node_cap: usize,
}

impl Default for NodeLimits {
    fn default() -> Self {
        NodeLimits {
            max_total_nodes: 1_000_000,
            per_node_cap: 1000,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Dotted/globbed class patterns to include; opaque to this crate, passed
    /// through to the instrumentation layer.
    pub include_patterns: Vec<String>,
    /// Dotted/globbed class patterns to exclude; opaque to this crate.
    pub exclude_patterns: Vec<String>,
    /// Class patterns for which constructors should be treated as method entries.
    pub track_constructors: Vec<String>,
    /// When set, the engine skips `on_construction` for heap-only allocation sites.
    pub filter_direct_only: bool,
    #[serde(with = "humantime_seconds")]
    pub push_interval: Duration,
    pub node_limits: NodeLimits,
    pub depth_limit: u16,
    pub interner_capacity: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            track_constructors: Vec::new(),
            filter_direct_only: false,
            push_interval: Duration::from_secs(60),
            node_limits: NodeLimits::default(),
            depth_limit: 100,
            interner_capacity: 65_536,
        }
    }
}

impl FlowConfig {
    /// Parses a `FlowConfig` from already-read TOML text. Reading the file itself,
    /// watching it for changes, and deciding when to restart are the configuration
    /// loader's job (§1 Non-goals: external collaborator) -- this is just the
    /// deserialization step.
    pub fn from_toml_str(text: &str) -> Result<FlowConfig, String> {
        toml::from_str(text).map_err(|e| format!("invalid flow-trace config: {e}"))
    }

    /// The fast-path, name-based test for `filter_direct_only` described in §6:
    /// `"heapBuffer"` in the allocation-site signature means skip tracking,
    /// `"directBuffer"` means track. Anything else falls through to the caller,
    /// who should consult the object kind's `is_direct()` capability instead.
    pub fn direct_only_fast_path(&self, allocation_site_sig: &str) -> Option<bool> {
        if !self.filter_direct_only {
            return Some(true);
        }
        let lower = allocation_site_sig.to_ascii_lowercase();
        if lower.contains("heapbuffer") {
            Some(false)
        } else if lower.contains("directbuffer") {
            Some(true)
        } else {
            None
        }
    }
}

/// `Duration` (de)serialization as whole seconds, matching the plain-integer
/// `push_interval` field shape of §6.
mod humantime_seconds {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
