//! Push-stream strategy.
//!
//! Subscribes to the upstream push channel from `last_height + 1` and spawns
//! a reader that enqueues blocks as they arrive, directly or through the
//! partial block collector. Any enqueue failure tears the subscription down;
//! the next loader cycle sees the dead reader and restarts the strategy.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::LoadStrategy;
use crate::config::LoaderStrategyName;
use crate::domain::{
    BlockBuffer, CollectorOutcome, IngestionError, PartialBlockCollector, Result, StreamMessage,
};
use crate::ports::BlockStream;

struct Subscription {
    id: String,
    token: CancellationToken,
    reader: JoinHandle<()>,
}

/// Push subscription loader.
pub struct PushStream {
    buffer: Arc<BlockBuffer>,
    stream: Arc<dyn BlockStream>,
    collector: Arc<PartialBlockCollector>,
    active: Mutex<Option<Subscription>>,
    last_seen: AtomicI64,
}

impl PushStream {
    /// Create the strategy.
    pub fn new(
        buffer: Arc<BlockBuffer>,
        stream: Arc<dyn BlockStream>,
        collector: Arc<PartialBlockCollector>,
    ) -> Self {
        let last_seen = AtomicI64::new(buffer.last_height());
        Self {
            buffer,
            stream,
            collector,
            active: Mutex::new(None),
            last_seen,
        }
    }

    /// Whether a subscription is open.
    pub fn is_subscribed(&self) -> bool {
        self.active.lock().is_some()
    }

    async fn subscribe(&self) -> Result<()> {
        let from_height = (self.buffer.last_height() + 1) as u64;
        let handle = self
            .stream
            .create_stream(from_height, self.buffer.height_ceiling())
            .await?;
        let token = CancellationToken::new();
        let reader = tokio::spawn(read_stream(
            handle.receiver,
            Arc::clone(&self.buffer),
            Arc::clone(&self.collector),
            token.clone(),
        ));
        tracing::info!(stream = %handle.id, from_height, "[qc-18] Push subscription opened");
        *self.active.lock() = Some(Subscription {
            id: handle.id,
            token,
            reader,
        });
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        let Some(sub) = self.active.lock().take() else {
            return Ok(());
        };
        sub.token.cancel();
        if let Err(e) = sub.reader.await {
            tracing::warn!(stream = %sub.id, error = %e, "[qc-18] Stream reader terminated abnormally");
        }
        self.collector.reset();
        self.stream.destroy_stream(&sub.id).await
    }
}

#[async_trait]
impl LoadStrategy for PushStream {
    fn name(&self) -> LoaderStrategyName {
        LoaderStrategyName::PushStream
    }

    async fn load(&self, _target_height: u64) -> Result<bool> {
        let reader_done = self
            .active
            .lock()
            .as_ref()
            .map(|sub| sub.reader.is_finished());
        match reader_done {
            None => self.subscribe().await?,
            Some(true) => {
                self.teardown().await?;
                return Err(IngestionError::StreamClosed(
                    "push subscription ended".to_string(),
                ));
            }
            Some(false) => {}
        }

        let last = self.buffer.last_height();
        let previous = self.last_seen.swap(last, Ordering::SeqCst);
        Ok(last != previous)
    }

    async fn stop(&self) -> Result<()> {
        self.last_seen
            .store(self.buffer.last_height(), Ordering::SeqCst);
        self.teardown().await
    }
}

async fn read_stream(
    mut receiver: mpsc::Receiver<StreamMessage>,
    buffer: Arc<BlockBuffer>,
    collector: Arc<PartialBlockCollector>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => return,
            message = receiver.recv() => message,
        };
        let Some(message) = message else {
            tracing::warn!("[qc-18] Push stream closed by upstream");
            return;
        };
        if let Err(e) = handle_message(message, &buffer, &collector) {
            tracing::warn!(
                error = %e,
                last_height = buffer.last_height(),
                "[qc-18] Push enqueue failed, tearing down subscription"
            );
            return;
        }
    }
}

fn handle_message(
    message: StreamMessage,
    buffer: &BlockBuffer,
    collector: &PartialBlockCollector,
) -> Result<()> {
    let outcome = match message {
        StreamMessage::Block(block) => {
            let height = block.height;
            return buffer.enqueue(block).map_err(|rejection| {
                IngestionError::StreamClosed(format!("block {height} rejected: {rejection}"))
            });
        }
        StreamMessage::Header {
            header,
            expected_tx_count,
        } => collector.add_block(header, expected_tx_count)?,
        StreamMessage::Transactions(fragment) => collector.add_transactions(fragment)?,
    };
    match outcome {
        CollectorOutcome::Rejected(rejection) => Err(IngestionError::StreamClosed(format!(
            "assembled block rejected: {rejection}"
        ))),
        _ => Ok(()),
    }
}
