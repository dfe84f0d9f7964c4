//! Store telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Duration;

struct StoreInstruments {
    save_ok: Counter<u64>,
    save_fail: Counter<u64>,
    errors: Counter<u64>,
    omitted_reads: Counter<u64>,
    put_wait_seconds: Histogram<f64>,
    put_exec_seconds: Histogram<f64>,
    get_wait_seconds: Histogram<f64>,
    get_exec_seconds: Histogram<f64>,
    chunk_size_at_save: Histogram<u64>,
    chunk_size_at_load: Histogram<u64>,
    chunks_per_response: Histogram<u64>,
    rows_per_response: Histogram<u64>,
    write_queue_depth: Histogram<u64>,
}

fn instruments() -> &'static StoreInstruments {
    static INSTRUMENTS: OnceLock<StoreInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("granary.store");
        StoreInstruments {
            save_ok: meter
                .u64_counter("granary.store.chunk_operations.save_ok")
                .with_description("Chunks saved successfully")
                .init(),
            save_fail: meter
                .u64_counter("granary.store.chunk_operations.save_fail")
                .with_description("Failed save attempts (each is retried)")
                .init(),
            errors: meter
                .u64_counter("granary.store.errors")
                .with_description("Recoverable errors by kind")
                .init(),
            omitted_reads: meter
                .u64_counter("granary.store.omit_read")
                .with_description("Reads failed without executing, by reason")
                .init(),
            put_wait_seconds: meter
                .f64_histogram("granary.store.put.wait")
                .with_description("Time a write request spent queued")
                .with_unit("s")
                .init(),
            put_exec_seconds: meter
                .f64_histogram("granary.store.put.exec")
                .with_description("Duration of insert execution")
                .with_unit("s")
                .init(),
            get_wait_seconds: meter
                .f64_histogram("granary.store.get.wait")
                .with_description("Time a read request spent queued")
                .with_unit("s")
                .init(),
            get_exec_seconds: meter
                .f64_histogram("granary.store.get.exec")
                .with_description("Duration of query execution")
                .with_unit("s")
                .init(),
            chunk_size_at_save: meter
                .u64_histogram("granary.store.chunk_size.at_save")
                .with_description("Chunk payload sizes seen when saving")
                .with_unit("By")
                .init(),
            chunk_size_at_load: meter
                .u64_histogram("granary.store.chunk_size.at_load")
                .with_description("Chunk payload sizes seen when loading")
                .with_unit("By")
                .init(),
            chunks_per_response: meter
                .u64_histogram("granary.store.chunks_per_response")
                .with_description("Chunks returned per search")
                .init(),
            rows_per_response: meter
                .u64_histogram("granary.store.rows_per_response")
                .with_description("Row keys queried per search")
                .init(),
            write_queue_depth: meter
                .u64_histogram("granary.store.write_queue.items")
                .with_description("Write shard depth sampled at enqueue and dequeue")
                .init(),
        }
    })
}

pub fn record_save_ok() {
    instruments().save_ok.add(1, &[]);
}

pub fn record_save_fail() {
    instruments().save_fail.add(1, &[]);
}

pub fn record_error_kind(kind: &'static str) {
    instruments()
        .errors
        .add(1, &[KeyValue::new("kind", kind)]);
}

pub fn record_omitted_read(reason: &'static str) {
    instruments()
        .omitted_reads
        .add(1, &[KeyValue::new("reason", reason)]);
}

pub fn record_put_wait(wait: Duration) {
    instruments().put_wait_seconds.record(wait.as_secs_f64(), &[]);
}

pub fn record_put_exec(duration: Duration) {
    instruments().put_exec_seconds.record(duration.as_secs_f64(), &[]);
}

pub fn record_get_wait(wait: Duration) {
    instruments().get_wait_seconds.record(wait.as_secs_f64(), &[]);
}

pub fn record_get_exec(duration: Duration) {
    instruments().get_exec_seconds.record(duration.as_secs_f64(), &[]);
}

pub fn record_chunk_size_at_save(bytes: usize) {
    instruments().chunk_size_at_save.record(bytes as u64, &[]);
}

pub fn record_chunk_size_at_load(bytes: usize) {
    instruments().chunk_size_at_load.record(bytes as u64, &[]);
}

pub fn record_search_response(rows: usize, chunks: usize) {
    let i = instruments();
    i.rows_per_response.record(rows as u64, &[]);
    i.chunks_per_response.record(chunks as u64, &[]);
}

pub fn record_write_queue_depth(depth: usize) {
    instruments().write_queue_depth.record(depth as u64, &[]);
}
