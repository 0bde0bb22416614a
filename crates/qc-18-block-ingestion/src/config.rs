//! # Block Ingestion Configuration
//!
//! Configuration for the ingestion pipeline.
//!
//! ## Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `QC_INGEST_MAX_BUFFER_BYTES` | `buffer.max_bytes` |
//! | `QC_INGEST_MAX_BUFFER_COUNT` | `buffer.max_count` |
//! | `QC_INGEST_MAX_HEIGHT` | `buffer.max_height` |
//! | `QC_INGEST_LEDGER_WINDOW` | `ledger_window_size` |
//! | `QC_INGEST_STRATEGY` | `loader.strategy` |
//! | `QC_INGEST_BATCH_LENGTH` | `loader.batch_length` |
//! | `QC_INGEST_WORKERS` | `loader.worker_count` |
//! | `QC_INGEST_PRELOAD_COUNT` | `loader.preload_count` |
//! | `QC_INGEST_CONCURRENCY` | `loader.concurrency` |
//! | `QC_INGEST_MAX_REQUEST_BYTES` | `loader.max_bytes_per_request` |
//! | `QC_INGEST_MAX_BATCH_BYTES` | `iterator.max_batch_bytes` |
//! | `QC_INGEST_REORG_SPLIT` | `reorg.split_threshold` |

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::algorithms::DEFAULT_REORG_SPLIT_THRESHOLD;
use crate::domain::{BufferLimits, IngestionError, Result, DEFAULT_LEDGER_WINDOW};

const MIB: u64 = 1024 * 1024;

/// Loader fetch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoaderStrategyName {
    /// One contiguous range request per cycle.
    ByBatches,
    /// One request per height across a worker pool.
    ByWorkers,
    /// Size-aware preload followed by concurrent fetch by hash.
    PreloadThenFetch,
    /// Push subscription.
    PushStream,
}

impl LoaderStrategyName {
    /// Name as used in configuration and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoaderStrategyName::ByBatches => "by-batches",
            LoaderStrategyName::ByWorkers => "by-workers",
            LoaderStrategyName::PreloadThenFetch => "preload-then-fetch",
            LoaderStrategyName::PushStream => "push-stream",
        }
    }
}

impl fmt::Display for LoaderStrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoaderStrategyName {
    type Err = IngestionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "by-batches" => Ok(LoaderStrategyName::ByBatches),
            "by-workers" => Ok(LoaderStrategyName::ByWorkers),
            "preload-then-fetch" => Ok(LoaderStrategyName::PreloadThenFetch),
            "push-stream" => Ok(LoaderStrategyName::PushStream),
            other => Err(IngestionError::InvalidConfig(format!(
                "unknown loader strategy '{other}'"
            ))),
        }
    }
}

/// Exponential polling interval settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// First interval, in milliseconds.
    pub initial_ms: u64,
    /// Growth factor applied after an idle cycle.
    pub multiplier: f64,
    /// Upper bound, in milliseconds.
    pub max_ms: u64,
}

impl PollConfig {
    /// Initial interval.
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// Interval ceiling.
    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(invalid(format!("{name}.initial_ms must be > 0")));
        }
        if !(self.multiplier >= 1.0) {
            return Err(invalid(format!("{name}.multiplier must be >= 1")));
        }
        if self.max_ms < self.initial_ms {
            return Err(invalid(format!("{name}.max_ms must be >= initial_ms")));
        }
        Ok(())
    }
}

/// Loader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Active strategy.
    pub strategy: LoaderStrategyName,
    /// Heights per cycle for `by-batches`.
    pub batch_length: usize,
    /// Parallel fetches per cycle for `by-workers`.
    pub worker_count: usize,
    /// Heights preloaded per cycle for `preload-then-fetch`.
    pub preload_count: usize,
    /// Concurrent fetch groups for `preload-then-fetch`.
    pub concurrency: usize,
    /// Byte budget of one fetch group.
    pub max_bytes_per_request: u64,
    /// Polling interval between cycles.
    pub poll: PollConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            strategy: LoaderStrategyName::PreloadThenFetch,
            batch_length: 10,
            worker_count: 8,
            preload_count: 500,
            concurrency: 4,
            max_bytes_per_request: 4 * MIB,
            poll: PollConfig {
                initial_ms: 100,
                multiplier: 2.0,
                max_ms: 10_000,
            },
        }
    }
}

/// Iterator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorConfig {
    /// Byte budget of one delivered batch.
    pub max_batch_bytes: u64,
    /// Polling interval between cycles.
    pub poll: PollConfig,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 8 * MIB,
            poll: PollConfig {
                initial_ms: 50,
                multiplier: 2.0,
                max_ms: 5_000,
            },
        }
    }
}

/// Reorganisation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgConfig {
    /// Invalidated blocks per reorg step.
    pub split_threshold: usize,
}

impl Default for ReorgConfig {
    fn default() -> Self {
        Self {
            split_threshold: DEFAULT_REORG_SPLIT_THRESHOLD,
        }
    }
}

/// Partial block collector settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Seconds after which an unfinished block is discarded.
    pub stale_after_secs: u64,
}

impl CollectorConfig {
    /// Staleness bound.
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 60,
        }
    }
}

/// Block ingestion configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Buffer limits.
    pub buffer: BufferLimits,
    /// Light blocks retained by the ledger.
    pub ledger_window_size: usize,
    /// Loader settings.
    pub loader: LoaderConfig,
    /// Iterator settings.
    pub iterator: IteratorConfig,
    /// Reorganisation settings.
    pub reorg: ReorgConfig,
    /// Collector settings.
    pub collector: CollectorConfig,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            buffer: BufferLimits::default(),
            ledger_window_size: DEFAULT_LEDGER_WINDOW,
            loader: LoaderConfig::default(),
            iterator: IteratorConfig::default(),
            reorg: ReorgConfig::default(),
            collector: CollectorConfig::default(),
        }
    }
}

impl IngestionConfig {
    /// Create a config for testing (small limits, fast polling).
    pub fn for_testing() -> Self {
        let fast = PollConfig {
            initial_ms: 5,
            multiplier: 2.0,
            max_ms: 40,
        };
        Self {
            buffer: BufferLimits {
                max_count: 100,
                max_bytes: 64 * 1024,
                max_height: None,
            },
            ledger_window_size: 200,
            loader: LoaderConfig {
                strategy: LoaderStrategyName::ByBatches,
                batch_length: 5,
                worker_count: 4,
                preload_count: 20,
                concurrency: 2,
                max_bytes_per_request: 1024,
                poll: fast,
            },
            iterator: IteratorConfig {
                max_batch_bytes: 4 * 1024,
                poll: fast,
            },
            reorg: ReorgConfig { split_threshold: 10 },
            collector: CollectorConfig { stale_after_secs: 5 },
        }
    }

    /// Same configuration with a different loader strategy.
    pub fn with_strategy(mut self, strategy: LoaderStrategyName) -> Self {
        self.loader.strategy = strategy;
        self
    }

    /// Defaults overridden by `QC_INGEST_*` environment variables.
    ///
    /// # Errors
    /// `InvalidConfig` if a variable is set but does not parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("QC_INGEST_MAX_BUFFER_BYTES")? {
            config.buffer.max_bytes = v;
        }
        if let Some(v) = env_parse("QC_INGEST_MAX_BUFFER_COUNT")? {
            config.buffer.max_count = v;
        }
        if let Some(v) = env_parse("QC_INGEST_MAX_HEIGHT")? {
            config.buffer.max_height = Some(v);
        }
        if let Some(v) = env_parse("QC_INGEST_LEDGER_WINDOW")? {
            config.ledger_window_size = v;
        }
        if let Some(v) = env_parse("QC_INGEST_STRATEGY")? {
            config.loader.strategy = v;
        }
        if let Some(v) = env_parse("QC_INGEST_BATCH_LENGTH")? {
            config.loader.batch_length = v;
        }
        if let Some(v) = env_parse("QC_INGEST_WORKERS")? {
            config.loader.worker_count = v;
        }
        if let Some(v) = env_parse("QC_INGEST_PRELOAD_COUNT")? {
            config.loader.preload_count = v;
        }
        if let Some(v) = env_parse("QC_INGEST_CONCURRENCY")? {
            config.loader.concurrency = v;
        }
        if let Some(v) = env_parse("QC_INGEST_MAX_REQUEST_BYTES")? {
            config.loader.max_bytes_per_request = v;
        }
        if let Some(v) = env_parse("QC_INGEST_MAX_BATCH_BYTES")? {
            config.iterator.max_batch_bytes = v;
        }
        if let Some(v) = env_parse("QC_INGEST_REORG_SPLIT")? {
            config.reorg.split_threshold = v;
        }
        Ok(config)
    }

    /// Check internal consistency.
    ///
    /// # Errors
    /// `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.buffer.max_count == 0 {
            return Err(invalid("buffer.max_count must be > 0"));
        }
        if self.buffer.max_bytes == 0 {
            return Err(invalid("buffer.max_bytes must be > 0"));
        }
        if self.ledger_window_size == 0 {
            return Err(invalid("ledger_window_size must be > 0"));
        }
        let loader = &self.loader;
        if loader.batch_length == 0 {
            return Err(invalid("loader.batch_length must be > 0"));
        }
        if loader.worker_count == 0 {
            return Err(invalid("loader.worker_count must be > 0"));
        }
        if loader.preload_count == 0 || loader.concurrency == 0 {
            return Err(invalid("loader.preload_count and loader.concurrency must be > 0"));
        }
        if loader.max_bytes_per_request == 0 {
            return Err(invalid("loader.max_bytes_per_request must be > 0"));
        }
        if loader.strategy == LoaderStrategyName::PreloadThenFetch
            && loader
                .max_bytes_per_request
                .saturating_mul(loader.concurrency as u64)
                > self.buffer.max_bytes
        {
            return Err(invalid(
                "loader.max_bytes_per_request x loader.concurrency exceeds buffer.max_bytes",
            ));
        }
        if self.iterator.max_batch_bytes == 0 {
            return Err(invalid("iterator.max_batch_bytes must be > 0"));
        }
        if self.reorg.split_threshold == 0 {
            return Err(invalid("reorg.split_threshold must be > 0"));
        }
        loader.poll.validate("loader.poll")?;
        self.iterator.poll.validate("iterator.poll")?;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> IngestionError {
    IngestionError::InvalidConfig(msg.into())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| invalid(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
