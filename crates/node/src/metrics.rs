//! Node metrics using the native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters. Use
//! traces for event-level granularity during investigations.

use prometheus::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for monitoring a validator.
pub struct Metrics {
    // === Consensus ===
    pub block_height: Gauge,
    pub round: Gauge,
    pub blocks_committed: Counter,
    pub block_interval: Histogram,

    // === WAL ===
    pub wal_records_written: Counter,
    pub wal_fsync_latency: Histogram,

    // === Storage ===
    pub rocksdb_read_latency: Histogram,
    pub rocksdb_write_latency: Histogram,
    pub evidence_persisted: Counter,

    // === Event loop ===
    pub events_processed: Counter,
    pub internal_sends_deferred: Counter,
}

impl Metrics {
    fn new() -> Self {
        let latency_buckets = vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];
        let interval_buckets = vec![0.1, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0];

        Self {
            block_height: register_gauge!("stanchion_block_height", "Current block height")
                .unwrap(),
            round: register_gauge!(
                "stanchion_round",
                "Current consensus round within the current height"
            )
            .unwrap(),
            blocks_committed: register_counter!(
                "stanchion_blocks_committed_total",
                "Total number of blocks committed"
            )
            .unwrap(),
            block_interval: register_histogram!(
                "stanchion_block_interval_seconds",
                "Time between consecutive commits",
                interval_buckets
            )
            .unwrap(),
            wal_records_written: register_counter!(
                "stanchion_wal_records_written_total",
                "Total WAL records written"
            )
            .unwrap(),
            wal_fsync_latency: register_histogram!(
                "stanchion_wal_fsync_latency_seconds",
                "WAL append-and-fsync latency",
                latency_buckets.clone()
            )
            .unwrap(),
            rocksdb_read_latency: register_histogram!(
                "stanchion_rocksdb_read_latency_seconds",
                "RocksDB read latency",
                latency_buckets.clone()
            )
            .unwrap(),
            rocksdb_write_latency: register_histogram!(
                "stanchion_rocksdb_write_latency_seconds",
                "RocksDB write latency",
                latency_buckets
            )
            .unwrap(),
            evidence_persisted: register_counter!(
                "stanchion_evidence_persisted_total",
                "Double-sign evidence records persisted"
            )
            .unwrap(),
            events_processed: register_counter!(
                "stanchion_events_processed_total",
                "Events processed by the consensus loop"
            )
            .unwrap(),
            internal_sends_deferred: register_counter!(
                "stanchion_internal_sends_deferred_total",
                "Self-messages that needed a deferred sender"
            )
            .unwrap(),
        }
    }
}

/// Global metrics accessor; registers on first use.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub fn record_step(height: u64, round: u32) {
    let m = metrics();
    m.block_height.set(height as f64);
    m.round.set(round as f64);
}

pub fn record_commit(interval_seconds: f64) {
    let m = metrics();
    m.blocks_committed.inc();
    m.block_interval.observe(interval_seconds);
}

pub fn record_wal_write(latency_seconds: f64) {
    let m = metrics();
    m.wal_records_written.inc();
    m.wal_fsync_latency.observe(latency_seconds);
}

pub fn record_rocksdb_read(latency_seconds: f64) {
    metrics().rocksdb_read_latency.observe(latency_seconds);
}

pub fn record_rocksdb_write(latency_seconds: f64) {
    metrics().rocksdb_write_latency.observe(latency_seconds);
}
