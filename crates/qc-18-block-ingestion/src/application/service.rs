//! # Ingestion Service
//!
//! Orchestrates the pipeline: one loader filling the buffer, one iterator
//! draining it into the consumer, the ledger recording what the consumer
//! applied and the reorg coordinator rolling both back on a fork.
//!
//! ## Batch lifecycle
//!
//! ```text
//! loader ──enqueue──▶ buffer ──batch──▶ iterator ──handle_batch──▶ consumer
//!                                                                    │
//!            ◀──────────── process_batch / confirm_batch ────────────┘
//! ```
//!
//! Fatal errors publish [`IngestionEvent::Fatal`] and stop both tasks.

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{Block, BlockHash, LightBlock};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::iterator::{AckGate, BlockIterator};
use super::loader::{build_strategy, Loader};
use super::reorg::{ReorgCoordinator, ReorgPlan};
use super::scheduler::PollInterval;
use crate::config::IngestionConfig;
use crate::domain::{
    BatchOutcome, BlockBatch, BlockBuffer, ChainLedger, IngestionError, IngestionEvent,
    IngestionStatus, ReorgSignal, Result,
};
use crate::ports::{BatchConsumer, BlockStream, IngestionApi, UpstreamSource};

/// Event channel capacity. Slow subscribers lag rather than block.
const EVENT_CAPACITY: usize = 256;

/// Block Ingestion Service.
pub struct IngestionService {
    config: IngestionConfig,
    buffer: Arc<BlockBuffer>,
    ledger: Mutex<ChainLedger>,
    gate: Arc<AckGate>,
    loader: Loader,
    iterator: BlockIterator,
    reorg: ReorgCoordinator,
    events: broadcast::Sender<IngestionEvent>,
}

impl IngestionService {
    /// Wire the pipeline. Nothing runs until `start`.
    ///
    /// # Errors
    /// `InvalidConfig` if the configuration does not validate or names the
    /// push-stream strategy without a `stream`.
    pub fn new(
        config: IngestionConfig,
        upstream: Arc<dyn UpstreamSource>,
        consumer: Arc<dyn BatchConsumer>,
        stream: Option<Arc<dyn BlockStream>>,
    ) -> Result<Self> {
        config.validate()?;
        if let Err(e) = quantum_telemetry::register_metrics() {
            tracing::warn!(error = %e, "[qc-18] Metrics registration failed");
        }
        let buffer = Arc::new(BlockBuffer::new(config.buffer, -1));
        let gate = Arc::new(AckGate::new());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let strategy = build_strategy(&config, Arc::clone(&buffer), Arc::clone(&upstream), stream)?;
        let loader = Loader::new(
            strategy,
            Arc::clone(&upstream),
            Arc::clone(&buffer),
            PollInterval::from(&config.loader.poll),
            events.clone(),
        );
        let iterator = BlockIterator::new(
            Arc::clone(&buffer),
            consumer,
            Arc::clone(&gate),
            config.iterator.max_batch_bytes,
            PollInterval::from(&config.iterator.poll),
            events.clone(),
        );
        let reorg = ReorgCoordinator::new(upstream, config.reorg.split_threshold);

        tracing::info!(
            strategy = %config.loader.strategy,
            max_count = config.buffer.max_count,
            max_bytes = config.buffer.max_bytes,
            ledger_window = config.ledger_window_size,
            "[qc-18] Ingestion service created"
        );
        Ok(Self {
            ledger: Mutex::new(ChainLedger::new(config.ledger_window_size)),
            config,
            buffer,
            gate,
            loader,
            iterator,
            reorg,
            events,
        })
    }

    /// Seed the ledger with already-applied blocks (oldest first) and point
    /// the buffer just past them.
    ///
    /// # Errors
    /// - `AlreadyRunning` while the pipeline runs.
    /// - `InvalidConfig` if `blocks` are not linked.
    pub fn resume_from(&self, blocks: &[LightBlock]) -> Result<()> {
        if self.loader.is_running() || self.iterator.is_running() {
            return Err(IngestionError::AlreadyRunning("ingestion service"));
        }
        let mut ledger = ChainLedger::new(self.config.ledger_window_size);
        if !ledger.add_blocks(blocks) {
            return Err(IngestionError::InvalidConfig(
                "resume blocks are not a linked chain".to_string(),
            ));
        }
        let tip_height = ledger.tip_height();
        *self.ledger.lock() = ledger;
        self.buffer.reset(tip_height);
        self.gate.open();
        tracing::info!(tip_height, "[qc-18] Resuming from ledger tip");
        Ok(())
    }

    /// Configuration in use.
    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    /// Shared buffer.
    pub fn buffer(&self) -> &Arc<BlockBuffer> {
        &self.buffer
    }

    /// Ledger tip height, -1 if empty.
    pub fn ledger_tip_height(&self) -> i64 {
        self.ledger.lock().tip_height()
    }

    /// Ledger contents, oldest first.
    pub fn ledger_blocks(&self) -> Vec<LightBlock> {
        let ledger = self.ledger.lock();
        ledger.get_last_n_blocks(ledger.len())
    }

    async fn halt(&self, cause: &IngestionError) {
        tracing::error!(
            error = %cause,
            last_height = self.buffer.last_height(),
            ledger_tip = self.ledger_tip_height(),
            "[qc-18] Unrecoverable error, halting ingestion"
        );
        let _ = self.events.send(IngestionEvent::Fatal {
            reason: cause.to_string(),
        });
        self.iterator.cancel();
        if let Err(e) = self.loader.stop().await {
            tracing::warn!(error = %e, "[qc-18] Loader stop failed during halt");
        }
    }

    async fn reorganise(&self) -> Result<BatchOutcome> {
        let loader_was_running = self.loader.is_running();
        if let Err(e) = self.loader.stop().await {
            tracing::warn!(error = %e, "[qc-18] Loader stop failed before reorg");
        }

        let local = self.ledger_blocks();
        let ReorgPlan {
            fork_height,
            depth,
            signals,
        } = match self.reorg.plan(&local).await {
            Ok(plan) => plan,
            Err(e) => {
                if !e.is_fatal() {
                    self.gate.open();
                    if loader_was_running {
                        self.loader.start()?;
                    }
                }
                return Err(e);
            }
        };

        {
            let mut ledger = self.ledger.lock();
            for signal in &signals {
                self.reorg.apply(signal, &mut ledger, &self.buffer);
            }
        }

        for signal in signals {
            let event = match signal {
                ReorgSignal::InProgress {
                    truncate_to,
                    invalidated,
                } => IngestionEvent::ReorgProgress {
                    truncated_to: truncate_to,
                    invalidated: invalidated.into_iter().map(|b| b.hash).collect(),
                },
                ReorgSignal::Completed { fork_height, .. } => {
                    IngestionEvent::ReorgCompleted { fork_height, depth }
                }
            };
            let _ = self.events.send(event);
        }

        self.gate.open();
        if loader_was_running {
            self.loader.start()?;
        }
        Ok(BatchOutcome::Reorganised { fork_height, depth })
    }
}

#[async_trait]
impl IngestionApi for IngestionService {
    async fn start(&self) -> Result<()> {
        self.loader.start()?;
        if let Err(e) = self.iterator.start() {
            self.loader.stop().await?;
            return Err(e);
        }
        tracing::info!(
            from_height = self.buffer.last_height() + 1,
            "[qc-18] Ingestion started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.iterator.stop().await;
        let result = self.loader.stop().await;
        tracing::info!(
            last_height = self.buffer.last_height(),
            buffered = self.buffer.len(),
            "[qc-18] Ingestion stopped"
        );
        result
    }

    async fn confirm_batch(&self, hashes: &[BlockHash]) -> Result<Vec<Block>> {
        let confirmed = match self.buffer.take_confirmed(hashes) {
            Ok(blocks) => blocks,
            Err(e) => {
                if e.is_fatal() {
                    self.halt(&e).await;
                }
                return Err(e);
            }
        };
        self.gate.open();
        if let (Some(first), Some(last)) = (confirmed.first(), confirmed.last()) {
            tracing::debug!(
                from_height = first.height,
                to_height = last.height,
                count = confirmed.len(),
                "[qc-18] Batch confirmed"
            );
            let _ = self.events.send(IngestionEvent::BatchConfirmed {
                from_height: first.height,
                to_height: last.height,
                count: confirmed.len(),
            });
        }
        Ok(confirmed)
    }

    async fn process_batch(&self, batch: &BlockBatch) -> Result<BatchOutcome> {
        let light = batch.light_blocks();
        let hashes = batch.hashes();
        let applied = {
            let mut ledger = self.ledger.lock();
            // The ledger only moves for blocks the buffer is about to release.
            self.buffer.verify_head(&hashes).map(|()| {
                let previous_tip = ledger.tip_height();
                if ledger.add_blocks(&light) {
                    Some((previous_tip, ledger.tip_height()))
                } else {
                    None
                }
            })
        };
        let applied = match applied {
            Ok(applied) => applied,
            Err(e) => {
                if e.is_fatal() {
                    self.halt(&e).await;
                }
                return Err(e);
            }
        };

        if let Some((previous_tip, tip_height)) = applied {
            if let Err(e) = self.confirm_batch(&hashes).await {
                self.ledger.lock().truncate_to_height(previous_tip);
                tracing::warn!(
                    request_id = %batch.request_id,
                    rolled_back_to = previous_tip,
                    error = %e,
                    "[qc-18] Confirmation failed, ledger rolled back"
                );
                return Err(e);
            }
            return Ok(BatchOutcome::Applied {
                count: batch.len(),
                tip_height,
            });
        }

        tracing::warn!(
            request_id = %batch.request_id,
            first_height = batch.height_range().map(|(from, _)| from),
            ledger_tip = self.ledger_tip_height(),
            "[qc-18] Batch does not extend the ledger"
        );
        match self.reorganise().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.is_fatal() {
                    self.halt(&e).await;
                }
                Err(e)
            }
        }
    }

    fn status(&self) -> IngestionStatus {
        let ledger_tip_height = self.ledger.lock().tip().map(|b| b.height);
        IngestionStatus {
            reorg_state: self.reorg.state(),
            buffer_len: self.buffer.len(),
            buffer_bytes: self.buffer.current_bytes(),
            last_buffered_height: self.buffer.last_height(),
            ledger_tip_height,
            loader_running: self.loader.is_running(),
            iterator_running: self.iterator.is_running(),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<IngestionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{build_chain, ChannelConsumer, InMemoryUpstream};
    use crate::config::LoaderStrategyName;
    use crate::domain::ReorgState;

    fn service(upstream: &Arc<InMemoryUpstream>) -> IngestionService {
        let (consumer, _rx) = ChannelConsumer::new(4);
        IngestionService::new(
            IngestionConfig::for_testing(),
            Arc::clone(upstream) as Arc<dyn UpstreamSource>,
            Arc::new(consumer),
            None,
        )
        .unwrap()
    }

    fn fill(service: &IngestionService, blocks: Vec<Block>) {
        for block in blocks {
            service.buffer().enqueue(block).unwrap();
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let upstream = Arc::new(InMemoryUpstream::new());
        let (consumer, _rx) = ChannelConsumer::new(1);
        let mut config = IngestionConfig::for_testing();
        config.buffer.max_count = 0;
        let result = IngestionService::new(
            config,
            upstream.clone() as Arc<dyn UpstreamSource>,
            Arc::new(consumer),
            None,
        );
        assert!(matches!(result, Err(IngestionError::InvalidConfig(_))));
    }

    #[test]
    fn test_push_stream_requires_stream() {
        let upstream = Arc::new(InMemoryUpstream::new());
        let (consumer, _rx) = ChannelConsumer::new(1);
        let config = IngestionConfig::for_testing().with_strategy(LoaderStrategyName::PushStream);
        let result = IngestionService::new(
            config,
            upstream.clone() as Arc<dyn UpstreamSource>,
            Arc::new(consumer),
            None,
        );
        assert!(matches!(result, Err(IngestionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_process_batch_applies_and_confirms() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 9, "A", "", 4)));
        let service = service(&upstream);
        let mut events = service.subscribe();
        fill(&service, build_chain(0, 4, "A", "", 4));

        let batch = BlockBatch::new(build_chain(0, 2, "A", "", 4));
        let outcome = service.process_batch(&batch).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Applied { count: 3, tip_height: 2 });
        assert_eq!(service.buffer().len(), 2);
        assert_eq!(service.ledger_tip_height(), 2);
        assert_eq!(
            events.try_recv().unwrap(),
            IngestionEvent::BatchConfirmed {
                from_height: 0,
                to_height: 2,
                count: 3
            }
        );
    }

    #[tokio::test]
    async fn test_process_batch_reorganises_on_fork() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 4, "A", "", 4)));
        let service = service(&upstream);
        fill(&service, build_chain(0, 4, "A", "", 4));
        let first = BlockBatch::new(build_chain(0, 4, "A", "", 4));
        service.process_batch(&first).await.unwrap();

        upstream.replace_from(4, build_chain(4, 6, "B", "A3", 4));
        fill(&service, build_chain(5, 6, "B", "B4", 4));
        let mut events = service.subscribe();

        let forked = BlockBatch::new(build_chain(5, 6, "B", "B4", 4));
        let outcome = service.process_batch(&forked).await.unwrap();
        assert_eq!(outcome, BatchOutcome::Reorganised { fork_height: 3, depth: 1 });
        assert_eq!(service.ledger_tip_height(), 3);
        assert_eq!(service.buffer().last_height(), 3);
        assert!(service.buffer().is_empty());
        assert_eq!(service.status().reorg_state, ReorgState::Normal);
        assert_eq!(
            events.try_recv().unwrap(),
            IngestionEvent::ReorgCompleted {
                fork_height: 3,
                depth: 1
            }
        );
    }

    #[tokio::test]
    async fn test_desync_is_fatal() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 4, "A", "", 4)));
        let service = service(&upstream);
        let mut events = service.subscribe();
        fill(&service, build_chain(0, 2, "A", "", 4));

        let err = service
            .confirm_batch(&["A1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Desynchronized { .. }));
        assert_eq!(service.buffer().len(), 3);
        assert!(matches!(
            events.try_recv().unwrap(),
            IngestionEvent::Fatal { .. }
        ));
    }

    #[tokio::test]
    async fn test_batch_not_at_buffer_head_leaves_ledger_alone() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 4, "A", "", 4)));
        let service = service(&upstream);
        fill(&service, build_chain(0, 4, "A", "", 4));
        service
            .process_batch(&BlockBatch::new(build_chain(0, 2, "A", "", 4)))
            .await
            .unwrap();
        let mut events = service.subscribe();

        // Extends the ledger tip, but the buffer head is A3.
        let stray = BlockBatch::new(build_chain(3, 3, "X", "A2", 4));
        let err = service.process_batch(&stray).await.unwrap_err();
        assert!(matches!(err, IngestionError::Desynchronized { .. }));
        assert_eq!(service.ledger_tip_height(), 2);
        assert_eq!(service.ledger_blocks().last().unwrap().hash, "A2");
        assert_eq!(service.buffer().peek_first().unwrap().hash, "A3");
        assert!(matches!(
            events.try_recv().unwrap(),
            IngestionEvent::Fatal { .. }
        ));
    }

    #[tokio::test]
    async fn test_resume_from_seeds_ledger_and_buffer() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 9, "A", "", 4)));
        let service = service(&upstream);
        let applied: Vec<LightBlock> = build_chain(0, 5, "A", "", 4)
            .iter()
            .map(LightBlock::from)
            .collect();

        service.resume_from(&applied).unwrap();
        let status = service.status();
        assert_eq!(status.ledger_tip_height, Some(5));
        assert_eq!(status.last_buffered_height, 5);

        let mut broken = applied.clone();
        broken.remove(2);
        assert!(service.resume_from(&broken).is_err());
    }

    #[tokio::test]
    async fn test_start_stop_status() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 3, "A", "", 4)));
        let service = service(&upstream);
        service.start().await.unwrap();
        assert!(matches!(
            service.start().await,
            Err(IngestionError::AlreadyRunning(_))
        ));
        let status = service.status();
        assert!(status.loader_running && status.iterator_running);
        assert!(matches!(
            service.resume_from(&[]),
            Err(IngestionError::AlreadyRunning(_))
        ));

        service.stop().await.unwrap();
        let status = service.status();
        assert!(!status.loader_running && !status.iterator_running);
    }
}
