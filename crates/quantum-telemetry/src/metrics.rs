//! Prometheus metrics for the block ingestion pipeline.
//!
//! All metrics follow the naming convention: `qc_<subsystem>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., blocks_enqueued_total)
//! - **Gauge**: Value that can go up or down (e.g., buffer_size_bytes)
//! - **Histogram**: Distribution of values (e.g., reorg_depth_blocks)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Counter, CounterVec, Encoder, Gauge, Histogram, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // BUFFER METRICS
    // =========================================================================

    /// Bytes currently held by the block buffer
    pub static ref BUFFER_BYTES: Gauge = Gauge::new(
        "qc_ingest_buffer_size_bytes",
        "Cumulative transaction size of buffered blocks"
    ).expect("metric creation failed");

    /// Blocks currently held by the block buffer
    pub static ref BUFFER_BLOCKS: Gauge = Gauge::new(
        "qc_ingest_buffer_blocks",
        "Number of blocks waiting in the buffer"
    ).expect("metric creation failed");

    /// Height of the most recently buffered block
    pub static ref BUFFER_LAST_HEIGHT: Gauge = Gauge::new(
        "qc_ingest_buffer_last_height",
        "Height of the most recently accepted block"
    ).expect("metric creation failed");

    /// Blocks accepted into the buffer
    pub static ref BLOCKS_ENQUEUED: Counter = Counter::new(
        "qc_ingest_blocks_enqueued_total",
        "Total number of blocks accepted into the buffer"
    ).expect("metric creation failed");

    /// Blocks rejected by the buffer, by reason
    pub static ref BLOCKS_REJECTED: CounterVec = CounterVec::new(
        Opts::new("qc_ingest_blocks_rejected_total", "Blocks rejected by the buffer"),
        &["reason"]  // reason: full/height/bytes/max_height
    ).expect("metric creation failed");

    // =========================================================================
    // LOADER METRICS
    // =========================================================================

    /// Upstream fetch retries, by strategy
    pub static ref FETCH_RETRIES: CounterVec = CounterVec::new(
        Opts::new("qc_ingest_fetch_retries_total", "Upstream fetch retries"),
        &["strategy"]
    ).expect("metric creation failed");

    /// Loader cycles, by outcome
    pub static ref LOADER_CYCLES: CounterVec = CounterVec::new(
        Opts::new("qc_ingest_loader_cycles_total", "Loader polling cycles"),
        &["outcome"]  // outcome: progress/idle/error
    ).expect("metric creation failed");

    // =========================================================================
    // ITERATOR METRICS
    // =========================================================================

    /// Batches handed to the downstream consumer
    pub static ref BATCHES_DISPATCHED: Counter = Counter::new(
        "qc_ingest_batches_dispatched_total",
        "Total number of batches handed to the consumer"
    ).expect("metric creation failed");

    /// Batches the consumer failed to handle
    pub static ref BATCHES_FAILED: Counter = Counter::new(
        "qc_ingest_batches_failed_total",
        "Total number of batches the consumer failed to handle"
    ).expect("metric creation failed");

    // =========================================================================
    // REORG METRICS
    // =========================================================================

    /// Completed reorganisations
    pub static ref REORGS: Counter = Counter::new(
        "qc_ingest_reorgs_total",
        "Total number of completed chain reorganisations"
    ).expect("metric creation failed");

    /// Number of invalidated blocks per reorganisation
    pub static ref REORG_DEPTH: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "qc_ingest_reorg_depth_blocks",
            "Blocks invalidated by a reorganisation"
        ).buckets(exponential_buckets(1.0, 2.0, 12).unwrap())
    ).expect("metric creation failed");
}

/// Handle for the registered metrics
pub struct MetricsHandle {
    _registry: Arc<Registry>,
}

/// Register all metrics with the crate registry. Safe to call more than once.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Buffer
        Box::new(BUFFER_BYTES.clone()),
        Box::new(BUFFER_BLOCKS.clone()),
        Box::new(BUFFER_LAST_HEIGHT.clone()),
        Box::new(BLOCKS_ENQUEUED.clone()),
        Box::new(BLOCKS_REJECTED.clone()),
        // Loader
        Box::new(FETCH_RETRIES.clone()),
        Box::new(LOADER_CYCLES.clone()),
        // Iterator
        Box::new(BATCHES_DISPATCHED.clone()),
        Box::new(BATCHES_FAILED.clone()),
        // Reorg
        Box::new(REORGS.clone()),
        Box::new(REORG_DEPTH.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        _registry: Arc::new(REGISTRY.clone()),
    })
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
