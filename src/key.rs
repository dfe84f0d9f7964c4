//! Metric key type and shard selection

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single stored series.
///
/// `id` is an opaque printable identifier, unique across the deployment
/// (callers typically embed a hash of the series definition). `org` is the
/// owning tenant; it participates in shard selection so that one tenant's
/// keys spread across write shards, but it is not part of the storage row
/// key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    pub org: u32,
    pub id: String,
}

impl MetricKey {
    pub fn new(org: u32, id: impl Into<String>) -> Self {
        Self { org, id: id.into() }
    }

    /// Selects the write shard for this key: org plus the byte sum of the
    /// identifier, modulo the shard count. Stable across restarts so a key's
    /// chunk writes always flow through the same queue, preserving their
    /// enqueue order.
    pub fn shard(&self, shards: usize) -> usize {
        let sum: u32 = self
            .id
            .as_bytes()
            .iter()
            .fold(self.org, |acc, b| acc.wrapping_add(u32::from(*b)));
        sum as usize % shards
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
