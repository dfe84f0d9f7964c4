//! In-memory metric table
//!
//! Holds, per metric key, a bounded ring of recent chunks receiving live
//! point ingest. Chunks sealed at span boundaries (or by the reaper, for
//! idle metrics) are handed to the persistence store as write requests; the
//! store acknowledges successful saves back into the metric's watermarks.

mod metric;
mod table;
pub(crate) mod telemetry;

pub use metric::AggregateMetric;
pub use table::MetricTable;

use crate::chunk::SealedChunk;
use crate::key::MetricKey;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// A sealed chunk on its way to the store.
///
/// Carries a handle back to its metric so the writer can acknowledge the
/// save; the registry stays the owner of the metric, the request only
/// borrows it. A request for a metric the reaper has since dropped still
/// completes, its acknowledgement landing on the orphaned handle.
pub struct ChunkWriteRequest {
    pub key: MetricKey,
    pub ttl: u32,
    pub span: u32,
    pub chunk: SealedChunk,
    pub enqueued_at: Instant,
    pub metric: Arc<AggregateMetric>,
}

impl fmt::Debug for ChunkWriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkWriteRequest")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("span", &self.span)
            .field("t0", &self.chunk.t0)
            .field("bytes", &self.chunk.series.len())
            .finish()
    }
}
