//! In-memory chunk session for development and tests
//!
//! Stores rows in plain maps, mirroring the layout of the real tables:
//! `(row_key, t0) -> frame`. Knobs for injected insert failures and
//! artificial select latency let the store's retry and queueing behavior be
//! exercised without a cluster. TTLs are accepted and ignored; expiry
//! belongs to the real backend.

use super::session::{ChunkRow, ChunkSession};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

type Table = BTreeMap<(String, u32), Vec<u8>>;

/// In-memory [`ChunkSession`].
#[derive(Default)]
pub struct MemorySession {
    tables: RwLock<HashMap<String, Table>>,
    fail_inserts: AtomicU32,
    insert_count: AtomicU64,
    select_count: AtomicU64,
    select_delay: RwLock<Option<Duration>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` inserts fail with a transient storage error.
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_inserts.store(n, Ordering::SeqCst);
    }

    /// Adds latency to every select, to simulate a slow cluster.
    pub fn set_select_delay(&self, delay: Option<Duration>) {
        *self.select_delay.write() = delay;
    }

    /// Successful inserts so far.
    pub fn inserts(&self) -> u64 {
        self.insert_count.load(Ordering::SeqCst)
    }

    /// Executed selects so far (omitted and canceled reads never reach
    /// this).
    pub fn selects(&self) -> u64 {
        self.select_count.load(Ordering::SeqCst)
    }

    /// Snapshot of one table's rows as `(row_key, t0, frame)`.
    pub fn rows(&self, table: &str) -> Vec<(String, u32, Vec<u8>)> {
        self.tables
            .read()
            .get(table)
            .map(|t| {
                t.iter()
                    .map(|((key, ts), data)| (key.clone(), *ts, data.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChunkSession for MemorySession {
    async fn insert_chunk(
        &self,
        table: &str,
        _ttl: u32,
        row_key: &str,
        t0: u32,
        data: &[u8],
    ) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) > 0 {
            self.fail_inserts.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::Storage("injected insert failure".into()));
        }
        self.tables
            .write()
            .entry(table.to_owned())
            .or_default()
            .insert((row_key.to_owned(), t0), data.to_vec());
        self.insert_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn select_chunks(
        &self,
        table: &str,
        row_keys: &[String],
        end: u32,
    ) -> Result<Vec<ChunkRow>> {
        let delay = *self.select_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.select_count.fetch_add(1, Ordering::SeqCst);

        let tables = self.tables.read();
        let Some(rows) = tables.get(table) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for row_key in row_keys {
            let range = (row_key.clone(), 0u32)..(row_key.clone(), end);
            for ((_, ts), data) in rows.range(range) {
                out.push(ChunkRow {
                    ts: *ts,
                    data: data.clone(),
                });
            }
        }
        Ok(out)
    }
}
