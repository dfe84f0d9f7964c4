//! Cassandra-backed chunk persistence
//!
//! Write side: sharded bounded queues, one writer worker per shard, with
//! unbounded capped-backoff retry. A chunk handed to the store represents
//! already-acknowledged data and is never dropped; a slow cluster turns
//! into backpressure on ingest through the bounded queues instead.
//!
//! Read side: one bounded queue drained by a pool of workers honoring the
//! caller's cancellation and the omit-read threshold; a read that waited
//! too long fails fast rather than pile onto an overloaded cluster.

pub mod memory;
pub mod session;
pub(crate) mod telemetry;
pub mod ttl;

pub use memory::MemorySession;
pub use session::{ChunkRow, ChunkSession, CqlChunkSession};
pub use ttl::{ttl_table, ttl_tables, TtlTable, TtlTables, TABLE_NAME_FORMAT};

use crate::chunk::format;
use crate::chunk::IterGen;
use crate::config::StoreConfig;
use crate::key::MetricKey;
use crate::mem::ChunkWriteRequest;
use crate::{Error, Result, MONTH_SEC};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Published when a chunk transitions from in-memory to durable.
#[derive(Debug, Clone)]
pub struct PersistMessage {
    pub key: MetricKey,
    pub t0: u32,
}

/// The persistence interface the metric table writes through and the query
/// layer reads through.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Queues a sealed chunk for persistence. Blocks while the key's write
    /// shard is full; never drops the chunk.
    async fn add(&self, cwr: ChunkWriteRequest);

    /// Returns generators for every chunk of `key` that could intersect
    /// `[start, end)`, sorted by ascending `t0`. The result over-fetches at
    /// the edges; the caller trims by timestamp.
    async fn search(
        &self,
        ctx: CancellationToken,
        key: &MetricKey,
        ttl: u32,
        start: u32,
        end: u32,
    ) -> Result<Vec<IterGen>>;
}

struct ChunkReadRequest {
    table: String,
    row_keys: Vec<String>,
    end: u32,
    enqueued_at: Instant,
    ctx: CancellationToken,
    out: oneshot::Sender<Result<Vec<ChunkRow>>>,
}

/// Chunk store over a CQL-shaped session.
pub struct CassandraStore {
    session: Arc<dyn ChunkSession>,
    write_queues: Vec<mpsc::Sender<ChunkWriteRequest>>,
    read_queue: mpsc::Sender<ChunkReadRequest>,
    read_rx: Mutex<mpsc::Receiver<ChunkReadRequest>>,
    ttl_tables: TtlTables,
    timeout: Duration,
    omit_read_timeout: Duration,
    persist: broadcast::Sender<PersistMessage>,
    shutdown: CancellationToken,
}

impl CassandraStore {
    /// Connects to the cluster, bootstraps the schema, and starts the
    /// worker pools.
    pub async fn connect(config: &StoreConfig, ttls: &[u32]) -> Result<Arc<Self>> {
        let tables = ttl_tables(ttls, config.window_factor, TABLE_NAME_FORMAT);
        let session = CqlChunkSession::connect(config, &tables).await?;
        Self::new(Arc::new(session), config, ttls)
    }

    /// Starts the store over an existing session. Must run inside a tokio
    /// runtime: the write and read workers are spawned here.
    pub fn new(
        session: Arc<dyn ChunkSession>,
        config: &StoreConfig,
        ttls: &[u32],
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let ttl_tables = ttl_tables(ttls, config.window_factor, TABLE_NAME_FORMAT);

        let mut write_queues = Vec::with_capacity(config.write_concurrency);
        let mut write_rxs = Vec::with_capacity(config.write_concurrency);
        for _ in 0..config.write_concurrency {
            let (tx, rx) = mpsc::channel(config.write_queue_size);
            write_queues.push(tx);
            write_rxs.push(rx);
        }
        let (read_queue, read_rx) = mpsc::channel(config.read_queue_size);
        let (persist, _) = broadcast::channel(1024);

        let store = Arc::new(Self {
            session,
            write_queues,
            read_queue,
            read_rx: Mutex::new(read_rx),
            ttl_tables,
            timeout: config.timeout(),
            omit_read_timeout: config.omit_read_timeout(),
            persist,
            shutdown: CancellationToken::new(),
        });

        for (shard, rx) in write_rxs.into_iter().enumerate() {
            let worker = Arc::clone(&store);
            tokio::spawn(async move { worker.process_write_queue(shard, rx).await });
        }
        for _ in 0..config.read_concurrency {
            let worker = Arc::clone(&store);
            tokio::spawn(async move { worker.process_read_queue().await });
        }

        info!(
            writers = config.write_concurrency,
            readers = config.read_concurrency,
            tables = store.ttl_tables.len(),
            "store started"
        );
        Ok(store)
    }

    /// Queues a sealed chunk onto its key's write shard, blocking while the
    /// shard is full.
    pub async fn add(&self, cwr: ChunkWriteRequest) {
        let shard = cwr.key.shard(self.write_queues.len());
        let queue = &self.write_queues[shard];
        telemetry::record_write_queue_depth(queue.max_capacity() - queue.capacity());
        if queue.send(cwr).await.is_err() {
            error!(shard, "write queue is closed, chunk lost");
        }
    }

    /// Searches `[start, end)` for one key.
    pub async fn search(
        &self,
        ctx: CancellationToken,
        key: &MetricKey,
        ttl: u32,
        start: u32,
        end: u32,
    ) -> Result<Vec<IterGen>> {
        if start >= end {
            telemetry::record_error_kind("invalid_range");
            return Err(Error::InvalidRange);
        }
        let table = self.table(ttl)?;
        let row_keys = row_keys(&key.to_string(), start, end);

        let (out, result) = oneshot::channel();
        let request = ChunkReadRequest {
            table: table.name.clone(),
            row_keys: row_keys.clone(),
            end,
            enqueued_at: Instant::now(),
            ctx: ctx.clone(),
            out,
        };

        if ctx.is_cancelled() {
            // no point queuing work for a caller that already gave up
            return Ok(Vec::new());
        }
        match self.read_queue.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                telemetry::record_omitted_read("queue_full");
                telemetry::record_error_kind("read_queue_full");
                return Err(Error::ReadQueueFull);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                return Err(Error::Storage("read queue is closed".into()));
            }
        }

        let rows = tokio::select! {
            _ = ctx.cancelled() => return Ok(Vec::new()),
            res = result => match res {
                Ok(Ok(rows)) => rows,
                Ok(Err(Error::Canceled)) => return Ok(Vec::new()),
                Ok(Err(err)) => {
                    telemetry::record_error_kind(err.kind());
                    return Err(err);
                }
                Err(_) => return Err(Error::Storage("read worker dropped the request".into())),
            },
        };

        let mut generators = Vec::with_capacity(rows.len());
        for row in rows {
            telemetry::record_chunk_size_at_load(row.data.len());
            if row.data.len() < 2 {
                telemetry::record_error_kind("chunk_too_small");
                return Err(Error::ChunkTooSmall(row.data.len()));
            }
            match IterGen::new(&row.data, row.ts) {
                Ok(gen) => generators.push(gen),
                Err(err) => {
                    telemetry::record_error_kind(err.kind());
                    return Err(err);
                }
            }
        }
        generators.sort_by_key(IterGen::t0);

        telemetry::record_search_response(row_keys.len(), generators.len());
        debug!(
            key = %key,
            rows = row_keys.len(),
            chunks = generators.len(),
            "search complete"
        );
        Ok(generators)
    }

    /// The physical tables this store routes to.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ttl_tables.values().map(|t| t.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Notifications for chunks that reached durability.
    pub fn subscribe_persist(&self) -> broadcast::Receiver<PersistMessage> {
        self.persist.subscribe()
    }

    /// Stops all workers. In-queue writes are abandoned; only call this on
    /// process shutdown.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn table(&self, ttl: u32) -> Result<&TtlTable> {
        self.ttl_tables.get(&ttl).ok_or(Error::TableNotFound(ttl))
    }

    async fn process_write_queue(self: Arc<Self>, shard: usize, mut rx: mpsc::Receiver<ChunkWriteRequest>) {
        debug!(shard, "write worker started");
        loop {
            let cwr = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                cwr = rx.recv() => match cwr {
                    Some(cwr) => cwr,
                    None => return,
                },
            };
            let queue = &self.write_queues[shard];
            telemetry::record_write_queue_depth(queue.max_capacity() - queue.capacity());
            telemetry::record_put_wait(cwr.enqueued_at.elapsed());
            self.save(cwr).await;
        }
    }

    /// Persists one chunk, retrying forever with capped backoff. The chunk
    /// was acknowledged to the ingest side long ago; dropping it here is
    /// not an option.
    async fn save(&self, cwr: ChunkWriteRequest) {
        let frame = format::encode_frame(cwr.span, &cwr.chunk.series);
        telemetry::record_chunk_size_at_save(frame.len());
        let key = cwr.key.to_string();

        let mut attempts: u32 = 0;
        loop {
            let pre = Instant::now();
            let result = self.insert_chunk(&key, cwr.chunk.t0, cwr.ttl, &frame).await;
            telemetry::record_put_exec(pre.elapsed());
            match result {
                Ok(()) => {
                    cwr.metric.sync_chunk_save_state(cwr.chunk.t0);
                    let _ = self.persist.send(PersistMessage {
                        key: cwr.key.clone(),
                        t0: cwr.chunk.t0,
                    });
                    telemetry::record_save_ok();
                    debug!(key = %key, t0 = cwr.chunk.t0, "save complete");
                    return;
                }
                Err(err) => {
                    telemetry::record_save_fail();
                    telemetry::record_error_kind(err.kind());
                    if attempts % 20 == 0 {
                        warn!(
                            key = %key,
                            t0 = cwr.chunk.t0,
                            attempts = attempts + 1,
                            error = %err,
                            "failed to save chunk, retrying"
                        );
                    }
                    let backoff = Duration::from_millis((100 * u64::from(attempts)).min(2000));
                    attempts += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => {
                            warn!(key = %key, t0 = cwr.chunk.t0, "shutdown during retry, chunk abandoned");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn insert_chunk(&self, key: &str, t0: u32, ttl: u32, frame: &[u8]) -> Result<()> {
        let table = self.table(ttl)?;
        let row_key = format!("{}_{}", key, t0 / MONTH_SEC);
        match tokio::time::timeout(
            self.timeout,
            self.session
                .insert_chunk(&table.name, ttl, &row_key, t0, frame),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Storage(format!(
                "insert into {} timed out",
                table.name
            ))),
        }
    }

    async fn process_read_queue(self: Arc<Self>) {
        loop {
            let request = {
                let mut rx = self.read_rx.lock().await;
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => return,
                    },
                }
            };
            self.execute_read(request).await;
        }
    }

    async fn execute_read(&self, request: ChunkReadRequest) {
        // canceled while queued: reply without touching the cluster
        if request.ctx.is_cancelled() {
            let _ = request.out.send(Err(Error::Canceled));
            return;
        }
        let wait = request.enqueued_at.elapsed();
        telemetry::record_get_wait(wait);
        if wait > self.omit_read_timeout {
            telemetry::record_omitted_read("too_old");
            telemetry::record_error_kind("read_too_old");
            let _ = request.out.send(Err(Error::ReadTooOld));
            return;
        }

        let pre = Instant::now();
        let result = tokio::select! {
            _ = request.ctx.cancelled() => Err(Error::Canceled),
            rows = self
                .session
                .select_chunks(&request.table, &request.row_keys, request.end) => rows,
        };
        telemetry::record_get_exec(pre.elapsed());
        let _ = request.out.send(result);
    }
}

#[async_trait]
impl ChunkStore for CassandraStore {
    async fn add(&self, cwr: ChunkWriteRequest) {
        CassandraStore::add(self, cwr).await;
    }

    async fn search(
        &self,
        ctx: CancellationToken,
        key: &MetricKey,
        ttl: u32,
        start: u32,
        end: u32,
    ) -> Result<Vec<IterGen>> {
        CassandraStore::search(self, ctx, key, ttl, start, end).await
    }
}

/// Row keys covering `[start, end)`: one per month bucket, `{key}_{month}`.
///
/// Any chunk containing `start` has `t0 <= start`, and because every span
/// divides a month evenly, that chunk's row is `start`'s month row. So the
/// month range `[start, end)` plus a `ts < end` restriction yields a strict
/// superset of the needed chunks, over-fetching at most one month's worth
/// of rows ahead of `start`.
fn row_keys(key: &str, start: u32, end: u32) -> Vec<String> {
    debug_assert!(start < end);
    let start_month = start / MONTH_SEC;
    let end_month = (end - 1) / MONTH_SEC;
    (start_month..=end_month)
        .map(|month| format!("{key}_{month}"))
        .collect()
}
