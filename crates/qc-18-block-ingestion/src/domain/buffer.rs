//! # Block Buffer
//!
//! Bounded FIFO of full blocks between the loader and the iterator.
//!
//! ## Invariants
//!
//! - A block is accepted only if `block.height == last_height + 1`
//! - A block's size is recomputed from its transactions on entry; the size
//!   the upstream declared is never trusted
//! - Blocks leave in the order they were accepted
//! - `len <= max_count`, `current_bytes <= max_bytes`, no block above `max_height`
//!
//! ## Concurrency
//!
//! Every operation that reads or mutates the queue takes one mutex for the
//! shortest possible critical section. `last_height`, `current_bytes` and
//! `len` are mirrored into atomics under that lock so the loader's
//! backpressure predicates never block.

use parking_lot::Mutex;
use quantum_telemetry::{
    BLOCKS_ENQUEUED, BLOCKS_REJECTED, BUFFER_BLOCKS, BUFFER_BYTES, BUFFER_LAST_HEIGHT,
};
use serde::{Deserialize, Serialize};
use shared_types::{Block, BlockHash};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use super::errors::{IngestionError, Rejection, Result};

/// Capacity limits of a [`BlockBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferLimits {
    /// Maximum number of blocks.
    pub max_count: usize,
    /// Maximum cumulative transaction size.
    pub max_bytes: u64,
    /// Height ceiling; no block above it is ever accepted.
    pub max_height: Option<u64>,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_count: 10_000,
            max_bytes: 64 * 1024 * 1024,
            max_height: None,
        }
    }
}

struct BufferState {
    blocks: VecDeque<Block>,
    last_height: i64,
    current_bytes: u64,
}

/// Bounded, height-ordered FIFO of blocks.
pub struct BlockBuffer {
    state: Mutex<BufferState>,
    limits: BufferLimits,
    last_height: AtomicI64,
    current_bytes: AtomicU64,
    len: AtomicUsize,
}

impl BlockBuffer {
    /// Create an empty buffer whose next accepted block is `last_height + 1`.
    ///
    /// Use `-1` to start from height 0.
    pub fn new(limits: BufferLimits, last_height: i64) -> Self {
        Self {
            state: Mutex::new(BufferState {
                blocks: VecDeque::new(),
                last_height,
                current_bytes: 0,
            }),
            limits,
            last_height: AtomicI64::new(last_height),
            current_bytes: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    fn sync_counters(&self, state: &BufferState) {
        self.last_height.store(state.last_height, Ordering::Release);
        self.current_bytes
            .store(state.current_bytes, Ordering::Release);
        self.len.store(state.blocks.len(), Ordering::Release);

        BUFFER_BYTES.set(state.current_bytes as f64);
        BUFFER_BLOCKS.set(state.blocks.len() as f64);
        BUFFER_LAST_HEIGHT.set(state.last_height as f64);
    }

    /// Append a block.
    ///
    /// # Errors
    /// A [`Rejection`] describing why the block was not accepted; the buffer
    /// is unchanged in that case.
    pub fn enqueue(&self, mut block: Block) -> std::result::Result<(), Rejection> {
        if let Err(e) = block.recompute_size() {
            tracing::debug!(height = block.height, error = %e, "[qc-18] Malformed block");
            BLOCKS_REJECTED.with_label_values(&["invalid"]).inc();
            return Err(Rejection::InvalidBlock {
                height: block.height,
            });
        }
        let mut state = self.state.lock();
        let verdict = self.check(&state, &block);
        if let Err(rejection) = verdict {
            BLOCKS_REJECTED.with_label_values(&[rejection.label()]).inc();
            return Err(rejection);
        }

        state.last_height = block.height as i64;
        state.current_bytes += block.size_bytes;
        state.blocks.push_back(block);
        self.sync_counters(&state);
        BLOCKS_ENQUEUED.inc();
        Ok(())
    }

    fn check(&self, state: &BufferState, block: &Block) -> std::result::Result<(), Rejection> {
        if state.blocks.len() >= self.limits.max_count {
            return Err(Rejection::Full);
        }
        let expected = state.last_height + 1;
        if block.height as i64 != expected {
            return Err(Rejection::HeightMismatch {
                expected,
                got: block.height,
            });
        }
        if let Some(max_height) = self.limits.max_height {
            if block.height > max_height {
                return Err(Rejection::MaxHeightReached { max_height });
            }
        }
        let fits = state
            .current_bytes
            .checked_add(block.size_bytes)
            .is_some_and(|total| total <= self.limits.max_bytes);
        if !fits {
            return Err(Rejection::ByteLimit {
                current: state.current_bytes,
                incoming: block.size_bytes,
                max: self.limits.max_bytes,
            });
        }
        Ok(())
    }

    /// Remove and return the oldest block.
    pub fn dequeue(&self) -> Option<Block> {
        let mut state = self.state.lock();
        let block = state.blocks.pop_front()?;
        state.current_bytes -= block.size_bytes;
        self.sync_counters(&state);
        Some(block)
    }

    /// Copy of the oldest block.
    pub fn peek_first(&self) -> Option<Block> {
        self.state.lock().blocks.front().cloned()
    }

    /// Longest prefix of blocks, oldest first, whose total size fits `max_bytes`.
    ///
    /// Nothing is removed. An empty buffer yields an empty batch.
    ///
    /// # Errors
    /// `BatchUnitTooLarge` if the oldest block alone exceeds `max_bytes`.
    pub fn get_batch_up_to_size(&self, max_bytes: u64) -> Result<Vec<Block>> {
        let state = self.state.lock();
        let mut total = 0u64;
        let mut batch = Vec::new();
        for block in &state.blocks {
            if total.saturating_add(block.size_bytes) > max_bytes {
                break;
            }
            total += block.size_bytes;
            batch.push(block.clone());
        }
        if batch.is_empty() {
            if let Some(first) = state.blocks.front() {
                return Err(IngestionError::BatchUnitTooLarge {
                    height: first.height,
                    size: first.size_bytes,
                    max: max_bytes,
                });
            }
        }
        Ok(batch)
    }

    /// Buffered blocks whose hash is in `hashes`, in no particular order.
    pub fn find_by_hashes(&self, hashes: &HashSet<BlockHash>) -> Vec<Block> {
        self.state
            .lock()
            .blocks
            .iter()
            .filter(|b| hashes.contains(&b.hash))
            .cloned()
            .collect()
    }

    /// Check that `hashes` match the head of the buffer in order, without
    /// removing anything.
    ///
    /// # Errors
    /// `Desynchronized` on the first hash that does not match.
    pub fn verify_head(&self, hashes: &[BlockHash]) -> Result<()> {
        Self::match_head(&self.state.lock(), hashes)
    }

    fn match_head(state: &BufferState, hashes: &[BlockHash]) -> Result<()> {
        for (i, expected) in hashes.iter().enumerate() {
            let found = state.blocks.get(i).map(|b| &b.hash);
            if found != Some(expected) {
                return Err(IngestionError::Desynchronized {
                    expected: expected.clone(),
                    found: found.cloned(),
                });
            }
        }
        Ok(())
    }

    /// Dequeue the blocks a consumer acknowledged.
    ///
    /// `hashes` must match the head of the buffer in order. The whole prefix
    /// is checked before anything is removed.
    ///
    /// # Errors
    /// `Desynchronized` on the first hash that does not match; the buffer is
    /// left untouched.
    pub fn take_confirmed(&self, hashes: &[BlockHash]) -> Result<Vec<Block>> {
        let mut state = self.state.lock();
        Self::match_head(&state, hashes)?;
        let taken: Vec<Block> = state.blocks.drain(..hashes.len()).collect();
        let freed: u64 = taken.iter().map(|b| b.size_bytes).sum();
        state.current_bytes -= freed;
        self.sync_counters(&state);
        Ok(taken)
    }

    /// Drop all blocks. `last_height` is kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.blocks.clear();
        state.current_bytes = 0;
        self.sync_counters(&state);
    }

    /// Drop all blocks and reseed so the next accepted block is `last_height + 1`.
    pub fn reset(&self, last_height: i64) {
        let mut state = self.state.lock();
        state.blocks.clear();
        state.current_bytes = 0;
        state.last_height = last_height;
        self.sync_counters(&state);
    }

    /// Count or byte ceiling reached.
    pub fn is_full(&self) -> bool {
        self.len() >= self.limits.max_count || self.current_bytes() >= self.limits.max_bytes
    }

    /// The last accepted block sits at the height ceiling.
    pub fn is_max_height_reached(&self) -> bool {
        match self.limits.max_height {
            Some(max) => self.last_height() >= max as i64,
            None => false,
        }
    }

    /// Whether `incoming` more bytes would exceed the byte ceiling.
    pub fn is_overloaded(&self, incoming: u64) -> bool {
        self.current_bytes().saturating_add(incoming) > self.limits.max_bytes
    }

    /// Blocks that can still be accepted before the count ceiling.
    pub fn remaining_capacity(&self) -> usize {
        self.limits.max_count.saturating_sub(self.len())
    }

    /// Highest height the buffer may ever accept.
    pub fn height_ceiling(&self) -> Option<u64> {
        self.limits.max_height
    }

    /// Height of the most recently accepted block (-1 if none).
    pub fn last_height(&self) -> i64 {
        self.last_height.load(Ordering::Acquire)
    }

    /// Bytes currently buffered.
    pub fn current_bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Acquire)
    }

    /// Blocks currently buffered.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured limits.
    pub fn limits(&self) -> &BufferLimits {
        &self.limits
    }
}

impl std::fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBuffer")
            .field("len", &self.len())
            .field("current_bytes", &self.current_bytes())
            .field("last_height", &self.last_height())
            .field("limits", &self.limits)
            .finish()
    }
}
