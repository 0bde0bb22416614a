//! # Inbound Ports
//!
//! API the ingestion service exposes to its host and to the batch consumer.

use async_trait::async_trait;
use shared_types::{Block, BlockHash};
use tokio::sync::broadcast;

use crate::domain::{BatchOutcome, BlockBatch, IngestionEvent, IngestionStatus, Result};

/// Block ingestion API - inbound port.
#[async_trait]
pub trait IngestionApi: Send + Sync {
    /// Start the loader and iterator tasks.
    async fn start(&self) -> Result<()>;

    /// Stop both tasks, letting in-flight cycles finish.
    async fn stop(&self) -> Result<()>;

    /// Acknowledge a batch: dequeue `hashes` from the buffer head and open
    /// the iterator gate.
    ///
    /// Fails with `Desynchronized` if the hashes do not match the head.
    async fn confirm_batch(&self, hashes: &[BlockHash]) -> Result<Vec<Block>>;

    /// Apply a delivered batch to the ledger, confirming it on success or
    /// running the reorganisation protocol when it does not fit.
    async fn process_batch(&self, batch: &BlockBatch) -> Result<BatchOutcome>;

    /// Snapshot of pipeline state.
    fn status(&self) -> IngestionStatus;

    /// Subscribe to pipeline events.
    fn subscribe(&self) -> broadcast::Receiver<IngestionEvent>;
}
