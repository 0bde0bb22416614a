//! # Block Iterator
//!
//! The single backpressure point between the buffer and the batch consumer.
//!
//! Each cycle waits for the acknowledgement gate, reads a byte-bounded batch
//! from the head of the buffer and hands it to the consumer with the gate
//! closed. Only an acknowledgement (or a consumer failure) opens it again.
//! A failed batch stays in the buffer and is offered again next cycle.

use parking_lot::Mutex;
use quantum_telemetry::{BATCHES_DISPATCHED, BATCHES_FAILED};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::scheduler::{CycleOutcome, PollInterval, PollingTask};
use crate::domain::{BlockBatch, BlockBuffer, IngestionError, IngestionEvent, Result};
use crate::ports::BatchConsumer;

/// Acknowledgement gate. Starts open.
#[derive(Debug)]
pub struct AckGate {
    state: watch::Sender<bool>,
}

impl AckGate {
    /// Create an open gate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self { state }
    }

    /// Open the gate, waking a waiting iterator.
    pub fn open(&self) {
        self.state.send_replace(true);
    }

    /// Close the gate.
    pub fn close(&self) {
        self.state.send_replace(false);
    }

    /// Whether the gate is open.
    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the gate is open.
    pub async fn wait_open(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this cannot fail while we wait.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for AckGate {
    fn default() -> Self {
        Self::new()
    }
}

struct IteratorInner {
    buffer: Arc<BlockBuffer>,
    consumer: Arc<dyn BatchConsumer>,
    gate: Arc<AckGate>,
    max_batch_bytes: u64,
    events: broadcast::Sender<IngestionEvent>,
}

impl IteratorInner {
    async fn cycle(&self, token: CancellationToken) -> CycleOutcome {
        tokio::select! {
            _ = token.cancelled() => return CycleOutcome::Idle,
            _ = self.gate.wait_open() => {}
        }

        let blocks = match self.buffer.get_batch_up_to_size(self.max_batch_bytes) {
            Ok(blocks) => blocks,
            Err(e) => {
                tracing::error!(error = %e, "[qc-18] Iterator cannot form a batch, halting");
                let _ = self.events.send(IngestionEvent::Fatal {
                    reason: e.to_string(),
                });
                return CycleOutcome::Halt;
            }
        };
        if blocks.is_empty() {
            return CycleOutcome::Idle;
        }

        let batch = BlockBatch::new(blocks);
        let request_id = batch.request_id.clone();
        let (from_height, to_height) = batch.height_range().unwrap_or_default();
        let count = batch.len();
        let bytes = batch.size_bytes();

        self.gate.close();
        BATCHES_DISPATCHED.inc();
        tracing::debug!(
            %request_id,
            from_height,
            to_height,
            count,
            bytes,
            "[qc-18] Dispatching batch"
        );

        match self.consumer.handle_batch(batch).await {
            Ok(()) => CycleOutcome::Progress,
            Err(e) => {
                BATCHES_FAILED.inc();
                tracing::warn!(
                    %request_id,
                    from_height,
                    error = %e,
                    "[qc-18] Consumer failed, batch will be retried"
                );
                self.gate.open();
                CycleOutcome::Idle
            }
        }
    }
}

/// Drains the buffer into the consumer one acknowledged batch at a time.
pub struct BlockIterator {
    inner: Arc<IteratorInner>,
    poll: PollInterval,
    task: Mutex<Option<PollingTask>>,
}

impl BlockIterator {
    /// Create a stopped iterator.
    pub fn new(
        buffer: Arc<BlockBuffer>,
        consumer: Arc<dyn BatchConsumer>,
        gate: Arc<AckGate>,
        max_batch_bytes: u64,
        poll: PollInterval,
        events: broadcast::Sender<IngestionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(IteratorInner {
                buffer,
                consumer,
                gate,
                max_batch_bytes,
                events,
            }),
            poll,
            task: Mutex::new(None),
        }
    }

    /// Spawn the polling task.
    ///
    /// # Errors
    /// `AlreadyRunning` if the task is running.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(IngestionError::AlreadyRunning("iterator"));
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(PollingTask::spawn("iterator", self.poll.clone(), move |token| {
            let inner = Arc::clone(&inner);
            async move { inner.cycle(token).await }
        }));
        tracing::info!(
            max_batch_bytes = self.inner.max_batch_bytes,
            "[qc-18] Iterator started"
        );
        Ok(())
    }

    /// Stop the polling task. A batch being handed over finishes first.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
            tracing::info!("[qc-18] Iterator stopped");
        }
    }

    /// Cancel the polling task without waiting for it.
    ///
    /// Safe to call from inside the consumer, where `stop` would wait on
    /// the very cycle that is calling it.
    pub fn cancel(&self) {
        if let Some(task) = self.task.lock().as_ref() {
            task.cancel();
        }
    }

    /// Whether the polling task is running.
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Run a single cycle inline.
    pub async fn run_once(&self) -> CycleOutcome {
        self.inner.cycle(CancellationToken::new()).await
    }
}
