//! # Partial Block Collector
//!
//! Assembles a full block from a header plus transaction fragments that a
//! push source delivers separately, then hands it to the [`BlockBuffer`].
//!
//! Only one block is assembled at a time and it must be the next height the
//! buffer expects. A height regression or a stale assembly discards the
//! partial state; the upstream re-delivers the block.

use parking_lot::Mutex;
use shared_types::{Block, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::buffer::BlockBuffer;
use super::errors::{Rejection, Result};
use super::value_objects::{BlockHeaderPart, TransactionFragment};

/// Default age after which an unfinished block is discarded.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// What a collector call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectorOutcome {
    /// A block was completed and accepted by the buffer.
    Completed {
        /// Height of the completed block.
        height: u64,
    },
    /// The block is still waiting for transactions.
    Pending {
        /// Transactions received so far.
        received: usize,
        /// Transactions expected in total.
        expected: usize,
    },
    /// The input did not match what the collector is waiting for.
    Ignored,
    /// A block was completed but the buffer refused it.
    Rejected(Rejection),
}

#[derive(Debug)]
struct InProgress {
    header: BlockHeaderPart,
    expected: usize,
    transactions: Vec<Transaction>,
    started_at: Instant,
}

/// Assembles headers and fragments into blocks.
pub struct PartialBlockCollector {
    buffer: Arc<BlockBuffer>,
    current: Mutex<Option<InProgress>>,
    stale_after: Duration,
}

impl PartialBlockCollector {
    /// Create a collector feeding `buffer`.
    pub fn new(buffer: Arc<BlockBuffer>, stale_after: Duration) -> Self {
        Self {
            buffer,
            current: Mutex::new(None),
            stale_after,
        }
    }

    /// Start assembling a block from its header.
    ///
    /// Accepted only if the header is the next height the buffer expects and
    /// nothing else is in progress. A header that already carries
    /// `expected_tx_count` transactions completes immediately.
    ///
    /// # Errors
    /// `InvalidBlock` if a completed block has no transactions.
    pub fn add_block(
        &self,
        header: BlockHeaderPart,
        expected_tx_count: usize,
    ) -> Result<CollectorOutcome> {
        let mut current = self.current.lock();
        self.discard_if_invalid(&mut current);

        if let Some(in_progress) = current.as_ref() {
            tracing::debug!(
                height = header.height,
                in_progress = in_progress.header.height,
                "[qc-18] Collector busy, header ignored"
            );
            return Ok(CollectorOutcome::Ignored);
        }

        let expected_height = self.buffer.last_height() + 1;
        if header.height as i64 != expected_height {
            tracing::debug!(
                height = header.height,
                expected = expected_height,
                "[qc-18] Collector ignored out-of-sequence header"
            );
            return Ok(CollectorOutcome::Ignored);
        }

        let in_progress = InProgress {
            transactions: header.transactions.clone(),
            header,
            expected: expected_tx_count,
            started_at: Instant::now(),
        };

        if in_progress.transactions.len() >= in_progress.expected {
            return self.complete(in_progress);
        }

        let outcome = CollectorOutcome::Pending {
            received: in_progress.transactions.len(),
            expected: in_progress.expected,
        };
        *current = Some(in_progress);
        Ok(outcome)
    }

    /// Add transactions for the block in progress.
    ///
    /// # Errors
    /// `InvalidBlock` if the completed block has no transactions.
    pub fn add_transactions(&self, fragment: TransactionFragment) -> Result<CollectorOutcome> {
        let mut current = self.current.lock();
        self.discard_if_invalid(&mut current);

        let Some(in_progress) = current.as_mut() else {
            return Ok(CollectorOutcome::Ignored);
        };
        if in_progress.header.hash != fragment.block_hash
            || in_progress.header.height != fragment.height
        {
            tracing::debug!(
                height = fragment.height,
                hash = %fragment.block_hash,
                "[qc-18] Fragment does not match block in progress"
            );
            return Ok(CollectorOutcome::Ignored);
        }

        in_progress.transactions.extend(fragment.transactions);
        if in_progress.transactions.len() < in_progress.expected {
            return Ok(CollectorOutcome::Pending {
                received: in_progress.transactions.len(),
                expected: in_progress.expected,
            });
        }

        match current.take() {
            Some(done) => self.complete(done),
            None => Ok(CollectorOutcome::Ignored),
        }
    }

    fn complete(&self, in_progress: InProgress) -> Result<CollectorOutcome> {
        let header = in_progress.header;
        let block = Block::new(
            header.height,
            header.hash,
            header.previous_hash,
            in_progress.transactions,
        )?;
        let height = block.height;
        match self.buffer.enqueue(block) {
            Ok(()) => {
                tracing::debug!(height, "[qc-18] Collector completed block");
                Ok(CollectorOutcome::Completed { height })
            }
            Err(rejection) => Ok(CollectorOutcome::Rejected(rejection)),
        }
    }

    fn discard_if_invalid(&self, current: &mut Option<InProgress>) {
        let Some(in_progress) = current.as_ref() else {
            return;
        };
        let expected_height = self.buffer.last_height() + 1;
        let regressed = in_progress.header.height as i64 != expected_height;
        let stale = in_progress.started_at.elapsed() >= self.stale_after;
        if regressed || stale {
            tracing::warn!(
                height = in_progress.header.height,
                expected_height,
                stale,
                "[qc-18] Discarding partial block"
            );
            *current = None;
        }
    }

    /// Drop any partial state.
    pub fn reset(&self) {
        *self.current.lock() = None;
    }

    /// Height of the block in progress.
    pub fn in_progress_height(&self) -> Option<u64> {
        self.current.lock().as_ref().map(|p| p.header.height)
    }
}
