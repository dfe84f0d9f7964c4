//! End-to-end tests for the persistence pipeline
//!
//! These run the real store (queues, workers, retry, search) over the
//! in-memory session, exercising:
//! - ingest -> seal -> save -> acknowledge -> search round trips
//! - unbounded write retry under injected transient failures
//! - read-queue overload, omit-read aging, and caller cancellation

use granary::chunk::format::encode_frame;
use granary::chunk::{IterGen, Point};
use granary::config::{RetentionConfig, StoreConfig};
use granary::key::MetricKey;
use granary::mem::MetricTable;
use granary::store::{CassandraStore, ChunkSession, MemorySession};
use granary::{Error, MONTH_SEC};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TTL: u32 = 3600; // routes to metric_1

fn store_config() -> StoreConfig {
    StoreConfig {
        write_concurrency: 2,
        write_queue_size: 16,
        read_concurrency: 2,
        read_queue_size: 16,
        omit_read_timeout_secs: 60,
        ..Default::default()
    }
}

fn retention() -> RetentionConfig {
    RetentionConfig {
        ttl: TTL,
        chunk_span: 600,
        num_chunks: 3,
        chunk_max_stale: 3600,
        metric_max_stale: 21600,
        gc_interval_secs: 3600,
    }
}

fn pipeline(
    config: StoreConfig,
) -> (Arc<MemorySession>, Arc<CassandraStore>, Arc<MetricTable>) {
    let session = Arc::new(MemorySession::new());
    let store = CassandraStore::new(session.clone(), &config, &[TTL]).unwrap();
    let table = MetricTable::new(retention(), store.clone()).unwrap();
    (session, store, table)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_write_then_search_round_trip() {
    let (session, store, table) = pipeline(store_config());
    let mut persisted = store.subscribe_persist();
    let key = MetricKey::new(1, "host1.cpu.idle");

    // three spans; the first two seal as their successors open
    table.append(&key, 610, 1.0).await;
    table.append(&key, 620, 2.0).await;
    table.append(&key, 1210, 3.0).await;
    table.append(&key, 1810, 4.0).await;

    let mut saved_t0s = Vec::new();
    for _ in 0..2 {
        let msg = timeout(Duration::from_secs(5), persisted.recv())
            .await
            .expect("persist notification should arrive")
            .unwrap();
        assert_eq!(msg.key, key);
        saved_t0s.push(msg.t0);
    }
    saved_t0s.sort_unstable();
    assert_eq!(saved_t0s, vec![600, 1200]);
    assert_eq!(session.inserts(), 2);

    // the save acknowledgements moved the metric's watermark
    let metric = table.get(&key).expect("metric is resident");
    assert_eq!(metric.last_save_finish(), 1200);
    assert_eq!(metric.last_save_start(), 1200);

    // the open chunk at 1800 is not persisted; search sees the sealed two
    let found = store
        .search(CancellationToken::new(), &key, TTL, 600, 1801)
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].t0(), 600);
    assert_eq!(found[1].t0(), 1200);
    assert_eq!(found[0].span(), Some(600));

    let points: Vec<Point> = found[0].get().map(|p| p.unwrap()).collect();
    assert_eq!(points, vec![
        Point { ts: 610, value: 1.0 },
        Point { ts: 620, value: 2.0 },
    ]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_writer_retries_until_insert_succeeds() {
    let config = StoreConfig {
        write_concurrency: 1,
        ..store_config()
    };
    let (session, store, table) = pipeline(config);
    let mut persisted = store.subscribe_persist();
    let key = MetricKey::new(1, "web.requests");

    // backoffs for 5 failures: 0+100+200+300+400 ms, then success
    session.fail_next_inserts(5);

    table.append(&key, 610, 1.0).await;
    table.append(&key, 1210, 2.0).await; // seals chunk 600

    let msg = timeout(Duration::from_secs(10), persisted.recv())
        .await
        .expect("chunk must survive transient failures")
        .unwrap();
    assert_eq!(msg.t0, 600);

    // exactly one successful insert, exactly one acknowledged save
    assert_eq!(session.inserts(), 1);
    let metric = table.get(&key).unwrap();
    assert_eq!(metric.last_save_finish(), 600);

    let rows = session.rows("metric_1");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0, "web.requests_0");
    assert_eq!(rows[0].1, 600);
    // the stored frame decodes
    let gen = IterGen::new(&rows[0].2, rows[0].1).unwrap();
    assert_eq!(gen.span(), Some(600));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_returns_superset_sorted_by_t0() {
    let (session, store, _table) = pipeline(store_config());
    let key = MetricKey::new(1, "foo");
    let span = 600;

    // chunks scattered across three month rows, inserted out of order
    let t0s = [
        7_257_600,            // month 3
        5_221_800,            // month 2, contains the query start
        2 * MONTH_SEC - span, // month 1, before the range
        7_257_000,            // month 2 tail
        5_222_400,            // month 2
        7_555_200,            // month 3, at/after end
    ];
    for t0 in t0s {
        let row_key = format!("foo_{}", t0 / MONTH_SEC);
        session
            .insert_chunk("metric_1", TTL, &row_key, t0, &encode_frame(span, &[0xde, 0xad]))
            .await
            .unwrap();
    }

    let found = store
        .search(CancellationToken::new(), &key, TTL, 5_222_000, 7_555_000)
        .await
        .unwrap();

    let found_t0s: Vec<u32> = found.iter().map(IterGen::t0).collect();
    // sorted ascending, covering every chunk whose interval can intersect
    // the range; month-2 rows before the start chunk are over-fetch, the
    // month-1 row and anything at/after end are not returned
    assert_eq!(found_t0s, vec![5_221_800, 5_222_400, 7_257_000, 7_257_600]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_rejects_invalid_range_and_unknown_ttl() {
    let (_session, store, _table) = pipeline(store_config());
    let key = MetricKey::new(1, "foo");

    assert!(matches!(
        store.search(CancellationToken::new(), &key, TTL, 100, 100).await,
        Err(Error::InvalidRange)
    ));
    assert!(matches!(
        store.search(CancellationToken::new(), &key, 9999, 0, 100).await,
        Err(Error::TableNotFound(9999))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overloaded_read_queue_rejects_without_blocking() {
    let config = StoreConfig {
        read_concurrency: 1,
        read_queue_size: 2,
        ..store_config()
    };
    let (session, store, _table) = pipeline(config);
    session.set_select_delay(Some(Duration::from_millis(500)));

    let key = MetricKey::new(1, "foo");
    let mut pending = Vec::new();
    // first search occupies the only worker
    {
        let store = store.clone();
        let key = key.clone();
        pending.push(tokio::spawn(async move {
            store.search(CancellationToken::new(), &key, TTL, 0, 100).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    // two more fill the queue
    for _ in 0..2 {
        let store = store.clone();
        let key = key.clone();
        pending.push(tokio::spawn(async move {
            store.search(CancellationToken::new(), &key, TTL, 0, 100).await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // queue full: the next search fails immediately instead of blocking
    let overflow = store
        .search(CancellationToken::new(), &key, TTL, 0, 100)
        .await;
    assert!(matches!(overflow, Err(Error::ReadQueueFull)));

    for handle in pending {
        assert!(handle.await.unwrap().is_ok());
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_canceled_search_returns_empty_without_querying() {
    let config = StoreConfig {
        read_concurrency: 1,
        ..store_config()
    };
    let (session, store, _table) = pipeline(config);
    session.set_select_delay(Some(Duration::from_millis(300)));

    let key = MetricKey::new(1, "foo");
    // occupy the only worker so the canceled request sits in the queue
    let busy = {
        let store = store.clone();
        let key = key.clone();
        tokio::spawn(async move {
            store.search(CancellationToken::new(), &key, TTL, 0, 100).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let ctx = CancellationToken::new();
    let canceled = {
        let store = store.clone();
        let key = key.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { store.search(ctx, &key, TTL, 0, 100).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    let result = canceled.await.unwrap();
    assert!(matches!(result, Ok(ref found) if found.is_empty()));

    assert!(busy.await.unwrap().is_ok());
    tokio::time::sleep(Duration::from_millis(200)).await;
    // only the busy search ever reached the session
    assert_eq!(session.selects(), 1);

    // a search arriving pre-canceled does not even enqueue
    let pre_canceled = CancellationToken::new();
    pre_canceled.cancel();
    let result = store.search(pre_canceled, &key, TTL, 0, 100).await.unwrap();
    assert!(result.is_empty());
    assert_eq!(session.selects(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_older_than_omit_threshold_is_not_executed() {
    let config = StoreConfig {
        read_concurrency: 1,
        omit_read_timeout_secs: 0,
        ..store_config()
    };
    let (session, store, _table) = pipeline(config);

    let key = MetricKey::new(1, "foo");
    let result = store
        .search(CancellationToken::new(), &key, TTL, 0, 100)
        .await;
    assert!(matches!(result, Err(Error::ReadTooOld)));
    assert_eq!(session.selects(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupt_frame_fails_the_search() {
    let (session, store, _table) = pipeline(store_config());
    let key = MetricKey::new(1, "foo");

    session
        .insert_chunk("metric_1", TTL, "foo_0", 600, &[0x01])
        .await
        .unwrap();
    let result = store
        .search(CancellationToken::new(), &key, TTL, 0, 1200)
        .await;
    assert!(matches!(result, Err(Error::ChunkTooSmall(1))));

    session
        .insert_chunk("metric_1", TTL, "foo_0", 600, &[0x77, 0x00, 0x00])
        .await
        .unwrap();
    let result = store
        .search(CancellationToken::new(), &key, TTL, 0, 1200)
        .await;
    assert!(matches!(result, Err(Error::UnknownFormat(0x77))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_table_names_reflect_routing() {
    let session = Arc::new(MemorySession::new());
    let store = CassandraStore::new(
        session,
        &store_config(),
        &[3600, 7200, 86400 * 7],
    )
    .unwrap();
    assert_eq!(
        store.table_names(),
        vec![
            "metric_1".to_owned(),
            "metric_128".to_owned(),
            "metric_2".to_owned()
        ]
    );
}
