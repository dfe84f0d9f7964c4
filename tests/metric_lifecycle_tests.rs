//! Metric table lifecycle tests
//!
//! Cover the registry's create-on-first-write behavior, the reaper's
//! seal-then-purge progression, and reaper safety against concurrent
//! metric creation.

use granary::config::{RetentionConfig, StoreConfig};
use granary::key::MetricKey;
use granary::mem::MetricTable;
use granary::store::{CassandraStore, MemorySession};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TTL: u32 = 3600;

fn retention() -> RetentionConfig {
    RetentionConfig {
        ttl: TTL,
        chunk_span: 60,
        num_chunks: 2,
        chunk_max_stale: 120,
        metric_max_stale: 300,
        gc_interval_secs: 3600,
    }
}

fn pipeline() -> (Arc<MemorySession>, Arc<CassandraStore>, Arc<MetricTable>) {
    let session = Arc::new(MemorySession::new());
    let config = StoreConfig {
        write_concurrency: 2,
        write_queue_size: 16,
        read_concurrency: 1,
        read_queue_size: 16,
        ..Default::default()
    };
    let store = CassandraStore::new(session.clone(), &config, &[TTL]).unwrap();
    let table = MetricTable::new(retention(), store.clone()).unwrap();
    (session, store, table)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metrics_are_created_lazily() {
    let (_session, _store, table) = pipeline();
    let key = MetricKey::new(1, "a.b.c");

    assert!(table.get(&key).is_none());
    assert!(table.is_empty());

    table.append(&key, 1000, 1.0).await;
    assert_eq!(table.len(), 1);

    let metric = table.get(&key).expect("created on first write");
    assert_eq!(metric.current_t0(), Some(960));

    // same handle on subsequent lookups
    assert!(Arc::ptr_eq(&metric, &table.get_or_create(&key)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reaper_seals_then_purges() {
    let (session, store, table) = pipeline();
    let mut persisted = store.subscribe_persist();
    let key = MetricKey::new(1, "idle.metric");

    table.append(&key, 1000, 1.0).await;
    let written_at = table.get(&key).unwrap().last_write();

    // past chunk_max_stale but not metric_max_stale: the open chunk gets
    // sealed and saved, the metric stays resident
    table.reap_once(written_at + 200).await;
    let msg = timeout(Duration::from_secs(5), persisted.recv())
        .await
        .expect("reaper-sealed chunk reaches the store")
        .unwrap();
    assert_eq!(msg.key, key);
    assert_eq!(msg.t0, 960);
    assert_eq!(table.len(), 1);
    assert_eq!(session.inserts(), 1);

    // past metric_max_stale: purged from the registry
    table.reap_once(written_at + 400).await;
    assert!(table.get(&key).is_none());
    assert!(table.is_empty());

    // no double-save of the already sealed chunk
    assert_eq!(session.inserts(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reaper_is_safe_under_concurrent_creation() {
    let (_session, _store, table) = pipeline();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let table = table.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let key = MetricKey::new(1, format!("series.{w}.{i}"));
                    table.append(&key, 1000 + i, 1.0).await;
                }
            })
        })
        .collect();

    let reaper = {
        let table = table.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                // every metric in this test was written moments ago, so no
                // pass may remove anything
                let now = granary::clock::WallClock::new().now_secs();
                table.reap_once(now).await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    };

    for writer in writers {
        writer.await.unwrap();
    }
    reaper.await.unwrap();

    assert_eq!(table.len(), 200, "no live metric may be reaped");
}
