//! Keyed registry of aggregated metrics with a background reaper

use super::{telemetry, AggregateMetric};
use crate::clock::WallClock;
use crate::config::RetentionConfig;
use crate::key::MetricKey;
use crate::store::ChunkStore;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Registry of live metrics, created lazily on first write.
///
/// Locking discipline: one readers/writer guard over the whole map. Writers
/// and readers take the read guard (metric state has its own per-instance
/// guard); `get_or_create` takes the exclusive guard briefly; the reaper is
/// the sole deleter and takes the exclusive guard only to delete.
pub struct MetricTable {
    metrics: RwLock<HashMap<MetricKey, Arc<AggregateMetric>>>,
    store: Arc<dyn ChunkStore>,
    retention: RetentionConfig,
    clock: WallClock,
    shutdown: CancellationToken,
}

impl MetricTable {
    pub fn new(retention: RetentionConfig, store: Arc<dyn ChunkStore>) -> Result<Arc<Self>> {
        retention.validate()?;
        Ok(Arc::new(Self {
            metrics: RwLock::new(HashMap::new()),
            store,
            retention,
            clock: WallClock::new(),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Read-only lookup.
    pub fn get(&self, key: &MetricKey) -> Option<Arc<AggregateMetric>> {
        self.metrics.read().get(key).cloned()
    }

    /// Returns the metric for `key`, inserting a fresh one under the
    /// exclusive guard when absent.
    pub fn get_or_create(&self, key: &MetricKey) -> Arc<AggregateMetric> {
        if let Some(metric) = self.get(key) {
            return metric;
        }
        let mut metrics = self.metrics.write();
        Arc::clone(metrics.entry(key.clone()).or_insert_with(|| {
            telemetry::record_metric_created();
            Arc::new(AggregateMetric::new(
                key.clone(),
                self.retention.chunk_span,
                self.retention.num_chunks,
                self.retention.ttl,
            ))
        }))
    }

    /// Ingests one point, forwarding any chunk the append sealed to the
    /// store, blocking on its write queue when full. That backpressure is
    /// how a slow store reaches ingest.
    ///
    /// Appends for one key must come from a single task; hash keys the way
    /// the store shards its writes and this holds naturally.
    pub async fn append(&self, key: &MetricKey, ts: u32, value: f64) {
        let metric = self.get_or_create(key);
        if let Some(request) = metric.append(self.clock.now_secs(), ts, value) {
            self.store.add(request).await;
        }
    }

    pub fn len(&self) -> usize {
        self.metrics.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.read().is_empty()
    }

    /// Token that stops the reaper loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// One reaper pass at wall-clock second `now`: seal chunks idle past
    /// `chunk_max_stale`, drop metrics idle past `metric_max_stale`.
    pub async fn reap_once(&self, now: u32) {
        let span = self.retention.chunk_span;
        let aligned = now - now % span;
        let chunk_min_ts = aligned.saturating_sub(self.retention.chunk_max_stale);
        let metric_min_ts = aligned.saturating_sub(self.retention.metric_max_stale);
        debug!(now, chunk_min_ts, metric_min_ts, "reaper pass");

        // snapshot under the read guard; creations racing this pass are
        // simply picked up next time
        let keys: Vec<MetricKey> = self.metrics.read().keys().cloned().collect();

        let mut reaped = 0u64;
        for key in keys {
            let Some(metric) = self.get(&key) else {
                continue;
            };
            let (request, stale) = metric.gc(chunk_min_ts, metric_min_ts);
            if let Some(request) = request {
                self.store.add(request).await;
            }
            if stale {
                info!(key = %key, "metric is stale, purging from memory");
                self.metrics.write().remove(&key);
                reaped += 1;
            }
        }
        telemetry::record_reaper_pass(self.len() as u64, reaped);
    }

    /// Background reaper loop; runs until the shutdown token fires.
    pub async fn run_reaper(&self) {
        let mut interval = tokio::time::interval(self.retention.gc_interval());
        // the first tick completes immediately; the reaper waits a full
        // interval before its first pass
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reap_once(self.clock.now_secs()).await;
                }
                _ = self.shutdown.cancelled() => {
                    info!("reaper shutting down");
                    return;
                }
            }
        }
    }
}
