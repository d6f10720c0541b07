//! Prometheus metrics
//!
//! Counters are recorded at the point of the event (fetch attempts, queue
//! deliveries, stream progress); gauges for cache and queue sizes are sampled
//! by the health loop in the binary. Without an installed recorder every call
//! here is a no-op.

use blockrelay_common::SourceTag;
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

use crate::cache::CacheStats;
use crate::queue::QueueStats;

// ============================================================================
// Metric Names
// ============================================================================

/// Fetch attempts per source, labelled by outcome.
pub const SOURCE_FETCHES: &str = "blockrelay_source_fetches_total";

/// Blocks handled per stream.
pub const BLOCKS_PROCESSED: &str = "blockrelay_blocks_processed_total";

/// Last height handled per stream.
pub const STREAM_HEIGHT: &str = "blockrelay_stream_height";

/// Queue deliveries, labelled by queue and outcome.
pub const QUEUE_DELIVERIES: &str = "blockrelay_queue_deliveries_total";

/// Tasks waiting in a queue.
pub const QUEUE_PENDING: &str = "blockrelay_queue_pending";

/// Dead letters recorded, labelled by error type.
pub const DEAD_LETTERS: &str = "blockrelay_dead_letters_total";

pub const CACHE_SIZE: &str = "blockrelay_cache_blocks";

pub const CACHE_HITS: &str = "blockrelay_cache_hits";

pub const CACHE_MISSES: &str = "blockrelay_cache_misses";

// ============================================================================
// Exporter
// ============================================================================

/// Install the global recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter on {addr}: {e}"))?;

    describe_counter!(SOURCE_FETCHES, "Block fetch attempts per source and outcome");
    describe_counter!(BLOCKS_PROCESSED, "Blocks handled per stream");
    describe_gauge!(STREAM_HEIGHT, "Last height handled per stream");
    describe_counter!(QUEUE_DELIVERIES, "Retry queue deliveries per queue and outcome");
    describe_gauge!(QUEUE_PENDING, "Tasks waiting per retry queue");
    describe_counter!(DEAD_LETTERS, "Dead letters recorded per error type");
    describe_gauge!(CACHE_SIZE, "Blocks held in the in-memory cache");
    describe_gauge!(CACHE_HITS, "Cache hits since start");
    describe_gauge!(CACHE_MISSES, "Cache misses since start");

    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

// ============================================================================
// Recording
// ============================================================================

pub fn record_fetch(source: SourceTag, outcome: &'static str) {
    counter!(SOURCE_FETCHES, "source" => source.as_str(), "outcome" => outcome).increment(1);
}

pub fn record_block(stream: &str, height: u64) {
    counter!(BLOCKS_PROCESSED, "stream" => stream.to_string()).increment(1);
    gauge!(STREAM_HEIGHT, "stream" => stream.to_string()).set(height as f64);
}

pub fn record_delivery(queue: &str, outcome: &'static str) {
    counter!(QUEUE_DELIVERIES, "queue" => queue.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_dead_letter(error_type: &str) {
    counter!(DEAD_LETTERS, "error_type" => error_type.to_string()).increment(1);
}

pub fn set_queue_stats(queue: &str, stats: &QueueStats) {
    gauge!(QUEUE_PENDING, "queue" => queue.to_string()).set(stats.pending as f64);
}

pub fn set_cache_stats(stats: &CacheStats) {
    gauge!(CACHE_SIZE).set(stats.len as f64);
    gauge!(CACHE_HITS).set(stats.hits as f64);
    gauge!(CACHE_MISSES).set(stats.misses as f64);
}
