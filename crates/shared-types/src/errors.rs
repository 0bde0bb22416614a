//! # Error Types
//!
//! Errors raised while constructing chain entities.

use thiserror::Error;

/// Errors that can occur when building a block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockError {
    /// A block must carry at least one transaction to be sized.
    #[error("Block at height {height} has no transactions")]
    NoTransactions { height: u64 },

    /// A transaction referenced a block it does not belong to.
    #[error("Transaction {txid} does not belong to block {block_hash}")]
    ForeignTransaction { txid: String, block_hash: String },
}
