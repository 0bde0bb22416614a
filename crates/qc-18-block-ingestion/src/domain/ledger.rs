//! # Chain Ledger
//!
//! Bounded, sequence-validating window of light blocks. It is the source of
//! truth for the last accepted height/hash and the reference the fork point
//! search compares upstream blocks against.
//!
//! ## Invariants
//!
//! - Adjacent blocks satisfy `next.height == prev.height + 1`
//! - Adjacent blocks satisfy `next.previous_hash == prev.hash`
//! - The window never holds more than `max_window_size` blocks; the oldest
//!   block is evicted when a new one would exceed it

use shared_types::LightBlock;
use std::collections::VecDeque;

/// Default number of light blocks retained.
pub const DEFAULT_LEDGER_WINDOW: usize = 5000;

/// Sequence-validating window of light blocks.
#[derive(Debug, Clone)]
pub struct ChainLedger {
    /// Blocks, oldest at the front.
    blocks: VecDeque<LightBlock>,
    /// Maximum window size.
    max_window_size: usize,
}

impl ChainLedger {
    /// Create an empty ledger.
    pub fn new(max_window_size: usize) -> Self {
        let max_window_size = max_window_size.max(1);
        Self {
            blocks: VecDeque::with_capacity(max_window_size.min(1024)),
            max_window_size,
        }
    }

    /// Append one block.
    ///
    /// Any block is accepted into an empty ledger. Otherwise the block must
    /// extend the tail; on mismatch nothing changes and `false` is returned.
    pub fn add_block(&mut self, block: LightBlock) -> bool {
        if let Some(tail) = self.blocks.back() {
            if !tail.is_parent_of(&block) {
                tracing::debug!(
                    tail_height = tail.height,
                    height = block.height,
                    previous_hash = %block.previous_hash,
                    "[qc-18] Ledger rejected block"
                );
                return false;
            }
        }
        self.push(block);
        true
    }

    /// Append a sequence of blocks, all or nothing.
    ///
    /// The whole candidate sequence is checked (internal linkage and fit
    /// against the current tail) before anything is appended.
    pub fn add_blocks(&mut self, blocks: &[LightBlock]) -> bool {
        let Some(first) = blocks.first() else {
            return true;
        };
        if let Some(tail) = self.blocks.back() {
            if !tail.is_parent_of(first) {
                tracing::debug!(
                    tail_height = tail.height,
                    first_height = first.height,
                    "[qc-18] Ledger rejected batch: does not extend tail"
                );
                return false;
            }
        }
        if let Some(broken) = blocks.windows(2).find(|w| !w[0].is_parent_of(&w[1])) {
            tracing::debug!(
                height = broken[1].height,
                "[qc-18] Ledger rejected batch: broken linkage"
            );
            return false;
        }
        for block in blocks {
            self.push(block.clone());
        }
        true
    }

    fn push(&mut self, block: LightBlock) {
        self.blocks.push_back(block);
        while self.blocks.len() > self.max_window_size {
            self.blocks.pop_front();
        }
    }

    /// Remove every block above `height`.
    ///
    /// - `-1` clears the ledger.
    /// - A height at or above the tail is already satisfied: no-op, `true`.
    /// - A height below `-1`, or below the oldest retained block, has no
    ///   matching node: no-op, `false`.
    pub fn truncate_to_height(&mut self, height: i64) -> bool {
        if height < -1 {
            return false;
        }
        if height == -1 {
            self.blocks.clear();
            return true;
        }
        let (Some(head), Some(tail)) = (self.blocks.front(), self.blocks.back()) else {
            return true;
        };
        let height = height as u64;
        if height >= tail.height {
            return true;
        }
        if height < head.height {
            return false;
        }
        let keep = (height - head.height + 1) as usize;
        self.blocks.truncate(keep);
        true
    }

    /// Find a block by height, scanning backwards from the tail.
    pub fn find_block_by_height(&self, height: u64) -> Option<&LightBlock> {
        self.blocks.iter().rev().find(|b| b.height == height)
    }

    /// Check the linkage invariants across the whole window.
    pub fn validate_chain(&self) -> bool {
        self.blocks
            .iter()
            .zip(self.blocks.iter().skip(1))
            .all(|(prev, next)| prev.is_parent_of(next))
    }

    /// The `n` most recent blocks, oldest first.
    pub fn get_last_n_blocks(&self, n: usize) -> Vec<LightBlock> {
        let skip = self.blocks.len().saturating_sub(n);
        self.blocks.iter().skip(skip).cloned().collect()
    }

    /// Most recent block.
    pub fn tip(&self) -> Option<&LightBlock> {
        self.blocks.back()
    }

    /// Oldest retained block.
    pub fn head(&self) -> Option<&LightBlock> {
        self.blocks.front()
    }

    /// Height of the most recent block, -1 if empty.
    pub fn tip_height(&self) -> i64 {
        self.blocks.back().map(|b| b.height as i64).unwrap_or(-1)
    }

    /// Number of retained blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Configured window size.
    pub fn max_window_size(&self) -> usize {
        self.max_window_size
    }
}

impl Default for ChainLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_WINDOW)
    }
}
