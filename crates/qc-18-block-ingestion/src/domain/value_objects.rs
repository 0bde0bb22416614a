//! # Value Objects
//!
//! Immutable messages exchanged between the ingestion components and their
//! collaborators.

use serde::{Deserialize, Serialize};
use shared_types::{Block, BlockHash, LightBlock, Transaction};
use uuid::Uuid;

/// How much of a block the upstream should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockDetail {
    /// Header and transaction ids only.
    Light,
    /// Full transactions with hex encoding.
    Full,
}

/// Cheap per-block metadata fetched ahead of the full block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadedBlockInfo {
    /// Block hash.
    pub hash: BlockHash,
    /// Total transaction size.
    pub size_bytes: u64,
    /// Block height.
    pub height: u64,
}

impl PreloadedBlockInfo {
    /// Create preload metadata.
    pub fn new(hash: impl Into<BlockHash>, size_bytes: u64, height: u64) -> Self {
        Self {
            hash: hash.into(),
            size_bytes,
            height,
        }
    }
}

/// Block header delivered by a push stream before its transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderPart {
    /// Block height.
    pub height: u64,
    /// Block hash.
    pub hash: BlockHash,
    /// Parent hash.
    pub previous_hash: BlockHash,
    /// Transactions already included with the header (may be empty).
    pub transactions: Vec<Transaction>,
}

/// A slice of a block's transactions delivered separately from its header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionFragment {
    /// Hash of the block the transactions belong to.
    pub block_hash: BlockHash,
    /// Height of that block.
    pub height: u64,
    /// Transactions in block order.
    pub transactions: Vec<Transaction>,
}

/// One message on a push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// A complete block.
    Block(Block),
    /// A header whose transactions follow in fragments.
    Header {
        /// The header.
        header: BlockHeaderPart,
        /// Total transactions the block will carry.
        expected_tx_count: usize,
    },
    /// Transactions for the block announced by the last header.
    Transactions(TransactionFragment),
}

/// A byte-bounded run of consecutive blocks handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBatch {
    /// Blocks, oldest first.
    pub blocks: Vec<Block>,
    /// Correlation id for logs and acknowledgements.
    pub request_id: String,
}

impl BlockBatch {
    /// Wrap blocks with a fresh request id.
    pub fn new(blocks: Vec<Block>) -> Self {
        Self {
            blocks,
            request_id: Uuid::new_v4().to_string(),
        }
    }

    /// Hashes in batch order, as expected by `confirm_batch`.
    pub fn hashes(&self) -> Vec<BlockHash> {
        self.blocks.iter().map(|b| b.hash.clone()).collect()
    }

    /// Light projections in batch order.
    pub fn light_blocks(&self) -> Vec<LightBlock> {
        self.blocks.iter().map(LightBlock::from).collect()
    }

    /// Total accounted size.
    pub fn size_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.size_bytes).sum()
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Height range covered, if any.
    pub fn height_range(&self) -> Option<(u64, u64)> {
        Some((self.blocks.first()?.height, self.blocks.last()?.height))
    }
}

/// Reorganisation state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorgState {
    /// Blocks flow normally.
    Normal,
    /// A fork was detected and local state is being rolled back.
    Reorganising,
}

/// Step of a reorganisation.
///
/// Large rollbacks are split into several `InProgress` steps, each truncating
/// the ledger a little further, followed by exactly one `Completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgSignal {
    /// Partial rollback: everything above `truncate_to` is invalid.
    InProgress {
        /// Height to truncate the ledger to.
        truncate_to: i64,
        /// Blocks invalidated by this step, newest first.
        invalidated: Vec<LightBlock>,
    },
    /// Final rollback to the fork point.
    Completed {
        /// Highest height both chains agree on (-1 if none).
        fork_height: i64,
        /// Blocks invalidated by this step, newest first.
        invalidated: Vec<LightBlock>,
    },
}

impl ReorgSignal {
    /// Height the ledger is truncated to when this signal is applied.
    pub fn target_height(&self) -> i64 {
        match self {
            ReorgSignal::InProgress { truncate_to, .. } => *truncate_to,
            ReorgSignal::Completed { fork_height, .. } => *fork_height,
        }
    }

    /// Blocks invalidated by this step.
    pub fn invalidated(&self) -> &[LightBlock] {
        match self {
            ReorgSignal::InProgress { invalidated, .. }
            | ReorgSignal::Completed { invalidated, .. } => invalidated,
        }
    }

    /// Whether this is the terminal signal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReorgSignal::Completed { .. })
    }
}

/// Notifications published by the ingestion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionEvent {
    /// The consumer acknowledged a batch and it left the buffer.
    BatchConfirmed {
        /// First confirmed height.
        from_height: u64,
        /// Last confirmed height.
        to_height: u64,
        /// Number of blocks.
        count: usize,
    },
    /// Part of a large rollback was applied.
    ReorgProgress {
        /// Ledger height after this step.
        truncated_to: i64,
        /// Hashes invalidated by this step.
        invalidated: Vec<BlockHash>,
    },
    /// Rollback to the fork point finished.
    ReorgCompleted {
        /// Fork height.
        fork_height: i64,
        /// Total blocks invalidated.
        depth: usize,
    },
    /// A loader cycle failed and the strategy was restarted.
    LoaderRestarted {
        /// Strategy name.
        strategy: String,
        /// Error that caused the restart.
        reason: String,
    },
    /// The pipeline halted on an unrecoverable error.
    Fatal {
        /// Error description.
        reason: String,
    },
}

/// Result of applying a consumer batch through the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The batch extended the ledger and was dequeued.
    Applied {
        /// Number of blocks applied.
        count: usize,
        /// Ledger tip height afterwards (-1 if the ledger is empty).
        tip_height: i64,
    },
    /// The batch did not fit the ledger; local state was rolled back.
    Reorganised {
        /// Fork height everything was reset to.
        fork_height: i64,
        /// Number of ledger blocks invalidated.
        depth: usize,
    },
}

/// Snapshot of pipeline state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionStatus {
    /// Reorganisation state.
    pub reorg_state: ReorgState,
    /// Blocks in the buffer.
    pub buffer_len: usize,
    /// Bytes in the buffer.
    pub buffer_bytes: u64,
    /// Height of the last buffered block (-1 if none since start).
    pub last_buffered_height: i64,
    /// Ledger tip height, if the ledger is non-empty.
    pub ledger_tip_height: Option<u64>,
    /// Whether the loader task is running.
    pub loader_running: bool,
    /// Whether the iterator task is running.
    pub iterator_running: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u64, size: u64) -> Block {
        Block::new(
            height,
            format!("h{height}"),
            format!("h{}", height.wrapping_sub(1)),
            vec![Transaction::with_size(format!("t{height}"), size)],
        )
        .unwrap()
    }

    #[test]
    fn test_batch_accessors() {
        let batch = BlockBatch::new(vec![block(3, 10), block(4, 20)]);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_bytes(), 30);
        assert_eq!(batch.height_range(), Some((3, 4)));
        assert_eq!(batch.hashes(), vec!["h3".to_string(), "h4".to_string()]);
        assert_eq!(batch.light_blocks()[1].previous_hash, "h3");
    }

    #[test]
    fn test_batch_request_ids_are_unique() {
        let a = BlockBatch::new(vec![]);
        let b = BlockBatch::new(vec![]);
        assert_ne!(a.request_id, b.request_id);
        assert!(a.is_empty());
        assert_eq!(a.height_range(), None);
    }

    #[test]
    fn test_reorg_signal_accessors() {
        let step = ReorgSignal::InProgress {
            truncate_to: 50,
            invalidated: vec![LightBlock::new(51, "x", "y", vec![])],
        };
        assert_eq!(step.target_height(), 50);
        assert_eq!(step.invalidated().len(), 1);
        assert!(!step.is_terminal());

        let done = ReorgSignal::Completed {
            fork_height: 10,
            invalidated: vec![],
        };
        assert!(done.is_terminal());
        assert_eq!(done.target_height(), 10);
    }
}
