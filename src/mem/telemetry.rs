//! Metric-table telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct MemInstruments {
    points_dropped: Counter<u64>,
    chunks_sealed: Counter<u64>,
    metrics_created: Counter<u64>,
    metrics_reaped: Counter<u64>,
    metrics_active: Histogram<u64>,
}

fn instruments() -> &'static MemInstruments {
    static INSTRUMENTS: OnceLock<MemInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("granary.mem");
        MemInstruments {
            points_dropped: meter
                .u64_counter("granary.mem.points.dropped")
                .with_description("Points rejected at append time, by reason")
                .init(),
            chunks_sealed: meter
                .u64_counter("granary.mem.chunks.sealed")
                .with_description("Chunks sealed and handed to the store, by trigger")
                .init(),
            metrics_created: meter
                .u64_counter("granary.mem.metrics.created")
                .with_description("Metrics lazily created on first write")
                .init(),
            metrics_reaped: meter
                .u64_counter("granary.mem.metrics.reaped")
                .with_description("Stale metrics removed by the reaper")
                .init(),
            metrics_active: meter
                .u64_histogram("granary.mem.metrics.active")
                .with_description("Metrics resident in memory, sampled per reaper pass")
                .init(),
        }
    })
}

pub fn record_point_dropped(reason: &'static str) {
    instruments()
        .points_dropped
        .add(1, &[KeyValue::new("reason", reason)]);
}

pub fn record_chunk_sealed(trigger: &'static str) {
    instruments()
        .chunks_sealed
        .add(1, &[KeyValue::new("trigger", trigger)]);
}

pub fn record_metric_created() {
    instruments().metrics_created.add(1, &[]);
}

pub fn record_reaper_pass(active: u64, reaped: u64) {
    let i = instruments();
    i.metrics_active.record(active, &[]);
    if reaped > 0 {
        i.metrics_reaped.add(reaped, &[]);
    }
}
