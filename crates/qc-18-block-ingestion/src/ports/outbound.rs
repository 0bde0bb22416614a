//! # Outbound Ports
//!
//! Traits for the collaborators the pipeline depends on: the upstream chain
//! source, an optional push subscription and the downstream batch consumer.

use async_trait::async_trait;
use shared_types::{Block, BlockHash};
use tokio::sync::mpsc;

use crate::domain::{BlockBatch, BlockDetail, PreloadedBlockInfo, Result, StreamMessage};

/// Authoritative upstream chain - outbound port.
///
/// Batch queries may return fewer blocks than requested (heights above the
/// upstream tip are simply missing). Order of the returned blocks is not
/// guaranteed.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Current chain height.
    async fn get_current_height(&self) -> Result<u64>;

    /// One block by height.
    async fn get_one_block_by_height(&self, height: u64, detail: BlockDetail) -> Result<Block>;

    /// Several blocks by height.
    async fn get_many_blocks_by_heights(
        &self,
        heights: &[u64],
        detail: BlockDetail,
    ) -> Result<Vec<Block>>;

    /// Several blocks by hash.
    async fn get_many_blocks_by_hashes(
        &self,
        hashes: &[BlockHash],
        detail: BlockDetail,
    ) -> Result<Vec<Block>>;

    /// Cheap size/hash metadata by height.
    async fn get_many_block_stats_by_heights(
        &self,
        heights: &[u64],
    ) -> Result<Vec<PreloadedBlockInfo>>;
}

/// An open push subscription.
#[derive(Debug)]
pub struct StreamHandle {
    /// Subscription id, passed back to `destroy_stream`.
    pub id: String,
    /// Messages in delivery order. Closed when the upstream ends the stream.
    pub receiver: mpsc::Receiver<StreamMessage>,
}

/// Push subscription source - outbound port.
#[async_trait]
pub trait BlockStream: Send + Sync {
    /// Subscribe to blocks from `from_height`, up to `to_height` if given.
    async fn create_stream(&self, from_height: u64, to_height: Option<u64>)
        -> Result<StreamHandle>;

    /// Tear down a subscription. Unknown ids are ignored.
    async fn destroy_stream(&self, id: &str) -> Result<()>;
}

/// Downstream batch consumer - outbound port.
///
/// `handle_batch` returning `Ok` means the batch was accepted for processing,
/// not that it was applied; the consumer acknowledges separately through
/// `confirm_batch` or `process_batch`.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    /// Hand over one batch.
    async fn handle_batch(&self, batch: BlockBatch) -> Result<()>;
}
