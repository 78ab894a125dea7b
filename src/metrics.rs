//! Metrics for observability.
//!
//! All metrics are emitted through the `metrics` facade; wiring a
//! Prometheus (or other) exporter is the embedding daemon's job. Names
//! follow Prometheus conventions under the `otr_` prefix.
//!
//! # Oplog-side metrics
//!
//! Recorded once per raw oplog entry, after transaction expansion:
//!
//! - counter `otr_oplog_entries_received{database,status}`
//! - counter `otr_oplog_entries_received_size{database}` (bytes)
//! - histogram `otr_oplog_entries_by_size{database,status}`
//! - gauge `otr_oplog_entries_max_size{database,status}` - the largest
//!   entry seen in the previous one-minute interval
//!
//! `status` is one of `ignored`, `processed`, `error`.
//!
//! # Redis-side metrics
//!
//! - counter `otr_redis_publications_total{partition}`
//! - counter `otr_redis_publications_deduped`
//! - counter `otr_redis_publish_retries_total`
//! - counter `otr_redis_checkpoint_writes_total{result}` where `result`
//!   is `advanced` or `stale`
//!
//! # Histogram buckets
//!
//! The facade does not carry bucket layout; exporters should configure
//! `otr_oplog_entries_by_size` with [`size_histogram_buckets()`]: a zero
//! bucket plus 29 exponential buckets starting at 8 with ratio 2.

use crate::interval_max::IntervalMax;
use metrics::{counter, gauge, histogram};
use std::sync::LazyLock;
use std::time::Duration;

/// How often the max-entry-size gauge rolls over.
const MAX_SIZE_INTERVAL: Duration = Duration::from_secs(60);

static ENTRY_MAX_SIZE: LazyLock<IntervalMax> =
    LazyLock::new(|| IntervalMax::new("otr_oplog_entries_max_size", MAX_SIZE_INTERVAL));

/// Bucket layout for the `otr_oplog_entries_by_size` histogram:
/// `{0, 8, 16, ..., 8 * 2^28}`.
pub fn size_histogram_buckets() -> Vec<f64> {
    let mut buckets = Vec::with_capacity(30);
    buckets.push(0.0);
    let mut bound = 8.0;
    for _ in 0..29 {
        buckets.push(bound);
        bound *= 2.0;
    }
    buckets
}

/// Record one received oplog entry with its processing status and size.
pub fn record_entry_received(database: &str, status: &str, size_bytes: usize) {
    counter!(
        "otr_oplog_entries_received",
        "database" => database.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    counter!(
        "otr_oplog_entries_received_size",
        "database" => database.to_string()
    )
    .increment(size_bytes as u64);
    histogram!(
        "otr_oplog_entries_by_size",
        "database" => database.to_string(),
        "status" => status.to_string()
    )
    .record(size_bytes as f64);
    ENTRY_MAX_SIZE.report(size_bytes as f64, database, status);
}

/// Record a publication successfully published to all its channels.
pub fn record_publication_published(partition: usize, channels: usize) {
    counter!(
        "otr_redis_publications_total",
        "partition" => partition.to_string()
    )
    .increment(1);
    counter!("otr_redis_publication_channels_total").increment(channels as u64);
}

/// Record a publication suppressed by the startup dedup gate.
pub fn record_publication_deduped() {
    counter!("otr_redis_publications_deduped").increment(1);
}

/// Record a Redis publish retry.
pub fn record_publish_retry() {
    counter!("otr_redis_publish_retries_total").increment(1);
}

/// Record a checkpoint write outcome: `advanced` or `stale` (another
/// writer already stored a newer position; not an error).
pub fn record_checkpoint_write(result: &str) {
    counter!(
        "otr_redis_checkpoint_writes_total",
        "result" => result.to_string()
    )
    .increment(1);
}

/// Gauge for relay lifecycle state, encoded numerically for alerting.
pub fn set_relay_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Connecting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("otr_relay_state").set(value);
}

/// Gauge for publisher partitions currently in backoff.
pub fn set_partitions_in_backoff(count: usize) {
    gauge!("otr_redis_partitions_in_backoff").set(count as f64);
}
