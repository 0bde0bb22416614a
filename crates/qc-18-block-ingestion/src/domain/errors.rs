//! # Domain Errors
//!
//! Error types for Block Ingestion.
//!
//! Sequencing violations are not errors: the ledger answers `false` and the
//! buffer answers with a [`Rejection`]. Everything here crosses a component
//! boundary and is handled by the orchestrating service.

use shared_types::{BlockError, BlockHash};
use thiserror::Error;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestionError>;

/// Block ingestion error types.
#[derive(Debug, Clone, Error)]
pub enum IngestionError {
    /// Upstream call failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// An upstream operation failed on every attempt.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Operation name (for logs).
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Error returned by the final attempt.
        last_error: String,
    },

    /// Acknowledged hashes do not match the head of the buffer.
    #[error("Buffer desynchronized: expected head {expected}, found {found:?}")]
    Desynchronized {
        /// Hash the consumer acknowledged.
        expected: BlockHash,
        /// Hash actually at the head of the buffer (None if empty).
        found: Option<BlockHash>,
    },

    /// Fork point search walked past the retained ledger window.
    #[error("Local chain diverged beyond the retained window of {window} blocks (lowest checked height {lowest_checked})")]
    DivergenceBeyondWindow {
        /// Ledger window size.
        window: usize,
        /// Lowest height compared against upstream.
        lowest_checked: u64,
    },

    /// A single block is larger than the batch size limit.
    #[error("Block {height} of {size} bytes exceeds batch limit of {max} bytes")]
    BatchUnitTooLarge {
        /// Height of the oversized block.
        height: u64,
        /// Its size.
        size: u64,
        /// The batch limit.
        max: u64,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The downstream consumer failed to handle a batch.
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// A push stream ended or could not be created.
    #[error("Stream closed: {0}")]
    StreamClosed(String),

    /// Block could not be constructed.
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockError),

    /// Operation requires a running component.
    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// Component was started twice.
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
}

impl IngestionError {
    /// Fatal errors mean buffer/ledger state can no longer be trusted, or the
    /// pipeline cannot make progress, and it must halt rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IngestionError::Desynchronized { .. }
                | IngestionError::DivergenceBeyondWindow { .. }
                | IngestionError::BatchUnitTooLarge { .. }
        )
    }
}

/// Reason a block was not accepted by the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    /// The buffer holds `max_count` blocks.
    #[error("buffer is full")]
    Full,

    /// The block does not extend the last accepted height.
    #[error("expected height {expected}, got {got}")]
    HeightMismatch {
        /// `last_height + 1`
        expected: i64,
        /// Height of the offered block.
        got: u64,
    },

    /// Accepting the block would exceed `max_bytes`.
    #[error("{current} + {incoming} bytes exceeds limit of {max}")]
    ByteLimit {
        /// Bytes currently buffered.
        current: u64,
        /// Size of the offered block.
        incoming: u64,
        /// Byte ceiling.
        max: u64,
    },

    /// The block is above the configured height ceiling.
    #[error("height ceiling {max_height} reached")]
    MaxHeightReached {
        /// Height ceiling.
        max_height: u64,
    },

    /// The block is malformed (carries no transactions).
    #[error("block {height} is malformed")]
    InvalidBlock {
        /// Height of the offered block.
        height: u64,
    },
}

impl Rejection {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::Full => "full",
            Rejection::HeightMismatch { .. } => "height",
            Rejection::ByteLimit { .. } => "bytes",
            Rejection::MaxHeightReached { .. } => "max_height",
            Rejection::InvalidBlock { .. } => "invalid",
        }
    }
}
