//! Per-key aggregated metric state machine

use super::{telemetry, ChunkWriteRequest};
use crate::chunk::{Chunk, SealedChunk};
use crate::key::MetricKey;
use crate::MONTH_SEC;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

struct MetricState {
    /// Ring of recent chunks, ordered by `t0` strictly ascending. The only
    /// chunk that can be open is the newest one.
    chunks: VecDeque<Chunk>,
    /// Wall-clock second of the last append attempt
    last_write: u32,
    /// `t0` of the newest chunk handed to the store
    last_save_start: u32,
    /// `t0` of the newest chunk the store acknowledged
    last_save_finish: u32,
}

/// One metric's in-memory state: a bounded ring of recent chunks, the
/// newest of which receives live appends.
///
/// Appends for a given key must be serialized by the caller (route each key
/// to a single append task; the store's shard discipline gives a suitable
/// hash). Readers of the save watermarks may run concurrently, as may the
/// reaper and the store's save acknowledgements.
pub struct AggregateMetric {
    key: MetricKey,
    ttl: u32,
    chunk_span: u32,
    num_chunks: usize,
    state: Mutex<MetricState>,
}

impl AggregateMetric {
    pub fn new(key: MetricKey, chunk_span: u32, num_chunks: usize, ttl: u32) -> Self {
        debug_assert!(num_chunks >= 1);
        debug_assert_eq!(MONTH_SEC % chunk_span, 0);
        Self {
            key,
            ttl,
            chunk_span,
            num_chunks,
            state: Mutex::new(MetricState {
                chunks: VecDeque::with_capacity(num_chunks),
                last_write: 0,
                last_save_start: 0,
                last_save_finish: 0,
            }),
        }
    }

    /// Appends one point. `now` is the current wall-clock second, `ts` the
    /// point's own timestamp.
    ///
    /// Returns the write request for the previous chunk when `ts` crossed a
    /// span boundary and sealed it; the caller hands that request to the
    /// store. Points older than the current chunk are dropped and counted,
    /// as are points for a span whose chunk was already sealed by the
    /// reaper.
    pub fn append(self: &Arc<Self>, now: u32, ts: u32, value: f64) -> Option<ChunkWriteRequest> {
        let t0 = ts - ts % self.chunk_span;
        let mut state = self.state.lock();
        let state = &mut *state;
        state.last_write = now;

        let current = match state.chunks.back() {
            Some(chunk) => (chunk.t0(), chunk.closed()),
            None => {
                let mut chunk = Chunk::new(t0, now);
                // first point of a fresh chunk is always in order
                let _ = chunk.push(now, ts, value);
                state.chunks.push_back(chunk);
                return None;
            }
        };

        if t0 < current.0 {
            debug!(key = %self.key, ts, current_t0 = current.0, "dropping out of order point");
            telemetry::record_point_dropped("out_of_order");
            return None;
        }

        if t0 == current.0 {
            if current.1 {
                debug!(key = %self.key, ts, "dropping point for sealed span");
                telemetry::record_point_dropped("sealed_span");
                return None;
            }
            if let Some(chunk) = state.chunks.back_mut() {
                if chunk.push(now, ts, value).is_err() {
                    debug!(key = %self.key, ts, "dropping out of order point");
                    telemetry::record_point_dropped("out_of_order");
                }
            }
            return None;
        }

        // ts crossed into a later span: seal the current chunk (unless the
        // reaper already did) and open a new one at t0
        let mut request = None;
        if !current.1 {
            if let Some(chunk) = state.chunks.back_mut() {
                let series = chunk.finish();
                let sealed = SealedChunk {
                    t0: chunk.t0(),
                    series,
                    num_points: chunk.num_points(),
                };
                state.last_save_start = state.last_save_start.max(sealed.t0);
                telemetry::record_chunk_sealed("span_boundary");
                request = Some(self.write_request(sealed));
            }
        }

        let mut chunk = Chunk::new(t0, now);
        let _ = chunk.push(now, ts, value);
        state.chunks.push_back(chunk);
        while state.chunks.len() > self.num_chunks {
            state.chunks.pop_front();
        }
        request
    }

    /// Reaper hook. Seals the open chunk when it has not seen an append
    /// since `chunk_min_ts`, returning the resulting write request. The
    /// returned flag is true when the whole metric is stale (everything
    /// sealed and no append since `metric_min_ts`) and may be dropped from
    /// the registry.
    pub fn gc(
        self: &Arc<Self>,
        chunk_min_ts: u32,
        metric_min_ts: u32,
    ) -> (Option<ChunkWriteRequest>, bool) {
        let mut state = self.state.lock();
        let state = &mut *state;

        let mut request = None;
        if let Some(chunk) = state.chunks.back_mut() {
            if !chunk.closed() && chunk.last_write() < chunk_min_ts {
                debug!(key = %self.key, t0 = chunk.t0(), "sealing stale chunk");
                let series = chunk.finish();
                let sealed = SealedChunk {
                    t0: chunk.t0(),
                    series,
                    num_points: chunk.num_points(),
                };
                state.last_save_start = state.last_save_start.max(sealed.t0);
                telemetry::record_chunk_sealed("stale");
                request = Some(self.write_request(sealed));
            }
        }

        let all_sealed = state.chunks.back().map_or(true, Chunk::closed);
        let stale = all_sealed && state.last_write < metric_min_ts;
        (request, stale)
    }

    /// Records a successful save. Acknowledgements may arrive out of order;
    /// the watermark only moves forward.
    pub fn sync_chunk_save_state(&self, t0: u32) {
        let mut state = self.state.lock();
        state.last_save_finish = state.last_save_finish.max(t0);
    }

    fn write_request(self: &Arc<Self>, chunk: SealedChunk) -> ChunkWriteRequest {
        ChunkWriteRequest {
            key: self.key.clone(),
            ttl: self.ttl,
            span: self.chunk_span,
            chunk,
            enqueued_at: Instant::now(),
            metric: Arc::clone(self),
        }
    }

    pub fn key(&self) -> &MetricKey {
        &self.key
    }

    pub fn chunk_span(&self) -> u32 {
        self.chunk_span
    }

    /// `t0` of the newest chunk, `None` before the first append.
    pub fn current_t0(&self) -> Option<u32> {
        self.state.lock().chunks.back().map(Chunk::t0)
    }

    pub fn ring_len(&self) -> usize {
        self.state.lock().chunks.len()
    }

    pub fn last_write(&self) -> u32 {
        self.state.lock().last_write
    }

    pub fn last_save_start(&self) -> u32 {
        self.state.lock().last_save_start
    }

    pub fn last_save_finish(&self) -> u32 {
        self.state.lock().last_save_finish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(span: u32, num_chunks: usize) -> Arc<AggregateMetric> {
        Arc::new(AggregateMetric::new(
            MetricKey::new(1, "test.metric"),
            span,
            num_chunks,
            3600,
        ))
    }

    #[test]
    fn test_first_append_opens_aligned_chunk() {
        let m = metric(600, 2);
        assert!(m.append(1000, 1000, 1.0).is_none());
        assert_eq!(m.current_t0(), Some(600));
        assert_eq!(m.ring_len(), 1);
    }

    #[test]
    fn test_span_crossing_seals_and_advances() {
        let m = metric(600, 2);
        assert!(m.append(1000, 1000, 1.0).is_none());

        let request = m.append(1001, 1600, 2.0).expect("crossing emits a write");
        assert_eq!(request.chunk.t0, 600);
        assert_eq!(request.span, 600);
        assert_eq!(request.ttl, 3600);
        assert_eq!(request.chunk.num_points, 1);
        assert!(!request.chunk.series.is_empty());

        assert_eq!(m.current_t0(), Some(1500));
        assert_eq!(m.ring_len(), 2);
        assert_eq!(m.last_save_start(), 600);
    }

    #[test]
    fn test_ring_is_bounded() {
        let m = metric(600, 2);
        m.append(10, 600, 1.0);
        m.append(11, 1200, 1.0);
        m.append(12, 1800, 1.0);
        m.append(13, 2400, 1.0);
        assert_eq!(m.ring_len(), 2);
        assert_eq!(m.current_t0(), Some(2400));
    }

    #[test]
    fn test_out_of_order_point_is_dropped() {
        let m = metric(600, 2);
        m.append(10, 1600, 1.0);
        assert!(m.append(11, 900, 2.0).is_none());
        assert_eq!(m.current_t0(), Some(1500));
        assert_eq!(m.ring_len(), 1);
    }

    #[test]
    fn test_gc_seals_stale_open_chunk() {
        let m = metric(100, 2);
        m.append(8_000, 8_000, 1.0);

        // reaper at now=10_000: chunkMinTs 9_000, metricMinTs 5_000
        let (request, stale) = m.gc(9_000, 5_000);
        let request = request.expect("stale chunk gets sealed");
        assert_eq!(request.chunk.t0, 8_000);
        assert!(!stale, "recently written metric stays resident");
    }

    #[test]
    fn test_gc_flags_fully_stale_metric() {
        let m = metric(100, 2);
        m.append(4_000, 4_000, 1.0);

        let (request, stale) = m.gc(9_000, 5_000);
        assert!(request.is_some());
        assert!(stale, "metric idle past metric_min_ts is reaped");
    }

    #[test]
    fn test_gc_leaves_fresh_chunk_alone() {
        let m = metric(100, 2);
        m.append(9_500, 9_500, 1.0);
        let (request, stale) = m.gc(9_000, 5_000);
        assert!(request.is_none());
        assert!(!stale);
    }

    #[test]
    fn test_point_in_reaper_sealed_span_is_dropped() {
        let m = metric(100, 2);
        m.append(4_000, 4_000, 1.0);
        let (request, _) = m.gc(9_000, 5_000);
        assert!(request.is_some());

        // same span, chunk already sealed
        assert!(m.append(10_000, 4_050, 2.0).is_none());
        assert_eq!(m.ring_len(), 1);

        // next span opens a fresh chunk without a second seal of the old one
        assert!(m.append(10_001, 4_100, 2.0).is_none());
        assert_eq!(m.current_t0(), Some(4_100));
    }

    #[test]
    fn test_save_state_takes_running_max() {
        let m = metric(600, 2);
        m.sync_chunk_save_state(1200);
        m.sync_chunk_save_state(600);
        assert_eq!(m.last_save_finish(), 1200);
        m.sync_chunk_save_state(1800);
        assert_eq!(m.last_save_finish(), 1800);
    }
}
