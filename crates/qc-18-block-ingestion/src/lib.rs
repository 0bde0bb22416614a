//! # QC-18 Block Ingestion
//!
//! Pulls blocks from an upstream node into a bounded buffer and hands them to
//! a downstream consumer in acknowledged, byte-bounded batches.
//!
//! **Subsystem ID:** 18  
//! **Architecture:** Hexagonal (DDD + Ports/Adapters)  
//! **Status:** Production-Ready
//!
//! ## Purpose
//!
//! - Keep a strictly height-ordered buffer filled from the upstream with one
//!   of four loader strategies
//! - Deliver batches one at a time, gated on the consumer's acknowledgement
//! - Track applied blocks in a sliding-window ledger and roll back to the
//!   fork point when the upstream reorganises
//!
//! ## Loader Strategies
//!
//! | Strategy | Fetch pattern |
//! |----------|---------------|
//! | `by-batches` | One ranged request per cycle |
//! | `by-workers` | One request per height, retried with exponential backoff |
//! | `preload-then-fetch` | Size metadata first, then byte-bounded groups by hash |
//! | `push-stream` | Upstream subscription, optionally fragmented |
//!
//! ## Module Structure
//!
//! ```text
//! qc-18-block-ingestion/
//! ├── domain/          # ChainLedger, BlockBuffer, PartialBlockCollector, errors
//! ├── algorithms/      # Fork search, preload grouping, reorg slicing, retry
//! ├── ports/           # API traits (inbound) + dependency traits (outbound)
//! ├── application/     # Scheduler, Loader, BlockIterator, ReorgCoordinator, IngestionService
//! ├── adapters/        # In-memory upstream and channel consumer
//! └── config.rs        # IngestionConfig
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod algorithms;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports
pub use adapters::{build_chain, ChannelConsumer, InMemoryUpstream};
pub use algorithms::{find_fork_point, split_reorg, ForkPoint, RetryPolicy};
pub use application::{
    AckGate, BlockIterator, IngestionService, LoadStrategy, Loader, ReorgCoordinator,
};
pub use config::{IngestionConfig, LoaderStrategyName};
pub use domain::{
    BatchOutcome, BlockBatch, BlockBuffer, BlockDetail, BufferLimits, ChainLedger,
    CollectorOutcome, IngestionError, IngestionEvent, IngestionStatus, PartialBlockCollector,
    PreloadedBlockInfo, ReorgSignal, ReorgState, Rejection, Result, StreamMessage,
    DEFAULT_LEDGER_WINDOW,
};
pub use ports::{BatchConsumer, BlockStream, IngestionApi, StreamHandle, UpstreamSource};

use quantum_telemetry::{TelemetryConfig, TelemetryError, TelemetryGuard};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Subsystem identifier.
pub const SUBSYSTEM_ID: &str = "18";

/// Telemetry configuration for this subsystem, read from the environment.
pub fn telemetry_config() -> TelemetryConfig {
    TelemetryConfig::for_subsystem(SUBSYSTEM_ID, "block-ingestion")
}

/// Install logging and register the ingestion metrics.
///
/// Hold the guard for the lifetime of the process.
///
/// # Errors
/// `TelemetryError::LoggingInit` if a global subscriber is already installed.
pub fn init_telemetry(
    config: TelemetryConfig,
) -> std::result::Result<TelemetryGuard, TelemetryError> {
    quantum_telemetry::init_telemetry(config)
}
