//! Batch consumer forwarding to an mpsc channel.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

use crate::domain::{BlockBatch, IngestionError, Result};
use crate::ports::outbound::BatchConsumer;

/// Forwards every batch to a channel; the receiving side acknowledges.
pub struct ChannelConsumer {
    sender: mpsc::Sender<BlockBatch>,
    failures: AtomicU32,
}

impl ChannelConsumer {
    /// Create the consumer and the receiving end of its channel.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BlockBatch>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                failures: AtomicU32::new(0),
            },
            receiver,
        )
    }

    /// Fail the next `n` batches.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl BatchConsumer for ChannelConsumer {
    async fn handle_batch(&self, batch: BlockBatch) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(IngestionError::Consumer(format!(
                "batch {} rejected",
                batch.request_id
            )));
        }
        self.sender
            .send(batch)
            .await
            .map_err(|_| IngestionError::Consumer("receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_forwards_batches() {
        let (consumer, mut rx) = ChannelConsumer::new(4);
        consumer.handle_batch(BlockBatch::new(vec![])).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (consumer, mut rx) = ChannelConsumer::new(4);
        consumer.fail_next(1);
        assert!(consumer.handle_batch(BlockBatch::new(vec![])).await.is_err());
        consumer.handle_batch(BlockBatch::new(vec![])).await.unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_an_error() {
        let (consumer, rx) = ChannelConsumer::new(1);
        drop(rx);
        assert!(matches!(
            consumer.handle_batch(BlockBatch::new(vec![])).await,
            Err(IngestionError::Consumer(_))
        ));
    }
}
