//! # Quantum Telemetry
//!
//! Logging and metrics shared by Quantum-Chain subsystems.
//!
//! ## Components
//!
//! - **Logging**: `tracing-subscriber` with an env filter, pretty or JSON output
//! - **Metrics**: Prometheus collectors for the block ingestion pipeline
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quantum_telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::for_subsystem("18", "block-ingestion");
//! let _guard = init_telemetry(config)?;
//! ```
//!
//! See [`TelemetryConfig::from_env`] for the environment variables.

#![warn(missing_docs)]

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{env_filter, init_logging, StructuredLogger};
pub use metrics::{
    encode_metrics, register_metrics, MetricsHandle, BATCHES_DISPATCHED, BATCHES_FAILED,
    BLOCKS_ENQUEUED, BLOCKS_REJECTED, BUFFER_BLOCKS, BUFFER_BYTES, BUFFER_LAST_HEIGHT,
    FETCH_RETRIES, LOADER_CYCLES, REORGS, REORG_DEPTH,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// The global subscriber could not be installed.
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    /// Metric registration or encoding failed.
    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and register metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    // Initialize metrics first (synchronous)
    let metrics_handle = register_metrics()?;

    let logger = init_logging(&config)?;

    Ok(TelemetryGuard {
        _logger: logger,
        _metrics: metrics_handle,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logger: StructuredLogger,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Telemetry guard dropped");
    }
}
