//! # Loader
//!
//! Keeps the block buffer filled up to the upstream height (or the buffer's
//! height ceiling) with exactly one active fetch strategy.
//!
//! Each polling cycle:
//! 1. Skip if the buffer is full or its height ceiling is reached
//! 2. Ask the upstream for its current height
//! 3. Run one `load` of the active strategy
//!
//! A failed cycle stops the strategy (dropping any per-strategy state) and
//! publishes `LoaderRestarted`; the next cycle starts it afresh.

mod by_batches;
mod by_workers;
mod preload;
mod push_stream;

pub use by_batches::ByBatches;
pub use by_workers::ByWorkers;
pub use preload::PreloadThenFetch;
pub use push_stream::PushStream;

use async_trait::async_trait;
use parking_lot::Mutex;
use quantum_telemetry::LOADER_CYCLES;
use shared_types::Block;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::scheduler::{CycleOutcome, PollInterval, PollingTask};
use crate::config::{IngestionConfig, LoaderStrategyName};
use crate::domain::{
    BlockBuffer, IngestionError, IngestionEvent, PartialBlockCollector, Rejection, Result,
};
use crate::ports::{BlockStream, UpstreamSource};

/// A fetch strategy.
#[async_trait]
pub trait LoadStrategy: Send + Sync {
    /// Strategy name.
    fn name(&self) -> LoaderStrategyName;

    /// Run one cycle towards `target_height`.
    ///
    /// Returns whether the buffer advanced.
    async fn load(&self, target_height: u64) -> Result<bool>;

    /// Drop per-strategy state. Idempotent.
    async fn stop(&self) -> Result<()>;
}

/// Build the strategy named in `config`.
///
/// # Errors
/// `InvalidConfig` if `push-stream` is selected without a stream source.
pub fn build_strategy(
    config: &IngestionConfig,
    buffer: Arc<BlockBuffer>,
    upstream: Arc<dyn UpstreamSource>,
    stream: Option<Arc<dyn BlockStream>>,
) -> Result<Arc<dyn LoadStrategy>> {
    let loader = &config.loader;
    let strategy: Arc<dyn LoadStrategy> = match loader.strategy {
        LoaderStrategyName::ByBatches => {
            Arc::new(ByBatches::new(buffer, upstream, loader.batch_length))
        }
        LoaderStrategyName::ByWorkers => {
            Arc::new(ByWorkers::new(buffer, upstream, loader.worker_count))
        }
        LoaderStrategyName::PreloadThenFetch => Arc::new(PreloadThenFetch::new(
            buffer,
            upstream,
            loader.preload_count,
            loader.concurrency,
            loader.max_bytes_per_request,
        )),
        LoaderStrategyName::PushStream => {
            let stream = stream.ok_or_else(|| {
                IngestionError::InvalidConfig(
                    "push-stream strategy requires a stream source".to_string(),
                )
            })?;
            let collector = Arc::new(PartialBlockCollector::new(
                Arc::clone(&buffer),
                config.collector.stale_after(),
            ));
            Arc::new(PushStream::new(buffer, stream, collector))
        }
    };
    Ok(strategy)
}

/// Result of [`enqueue_ordered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EnqueueReport {
    /// Blocks accepted.
    pub accepted: usize,
    /// Rejection that stopped the run, if any.
    pub rejection: Option<Rejection>,
}

/// Enqueue fetched blocks lowest height first.
///
/// Blocks at or below the buffer's last height are skipped. Stops at the
/// first rejection so the buffer stays strictly ordered.
pub(crate) fn enqueue_ordered(
    buffer: &BlockBuffer,
    mut blocks: Vec<Block>,
    strategy: LoaderStrategyName,
) -> EnqueueReport {
    blocks.sort_by(|a, b| b.height.cmp(&a.height));
    let mut accepted = 0;
    while let Some(block) = blocks.pop() {
        if block.height as i64 <= buffer.last_height() {
            continue;
        }
        let height = block.height;
        if let Err(rejection) = buffer.enqueue(block) {
            if matches!(rejection, Rejection::InvalidBlock { .. }) {
                tracing::warn!(%strategy, height, "[qc-18] Upstream served a malformed block");
            }
            tracing::debug!(
                %strategy,
                height,
                reason = %rejection,
                accepted,
                "[qc-18] Enqueue stopped"
            );
            return EnqueueReport {
                accepted,
                rejection: Some(rejection),
            };
        }
        accepted += 1;
    }
    EnqueueReport {
        accepted,
        rejection: None,
    }
}

struct LoaderInner {
    strategy: Arc<dyn LoadStrategy>,
    upstream: Arc<dyn UpstreamSource>,
    buffer: Arc<BlockBuffer>,
    events: broadcast::Sender<IngestionEvent>,
}

impl LoaderInner {
    async fn cycle(&self) -> CycleOutcome {
        if self.buffer.is_full() || self.buffer.is_max_height_reached() {
            LOADER_CYCLES.with_label_values(&["idle"]).inc();
            return CycleOutcome::Idle;
        }

        let result = match self.upstream.get_current_height().await {
            Ok(upstream_height) => {
                let target = match self.buffer.height_ceiling() {
                    Some(ceiling) => upstream_height.min(ceiling),
                    None => upstream_height,
                };
                self.strategy.load(target).await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(true) => {
                LOADER_CYCLES.with_label_values(&["progress"]).inc();
                CycleOutcome::Progress
            }
            Ok(false) => {
                LOADER_CYCLES.with_label_values(&["idle"]).inc();
                CycleOutcome::Idle
            }
            Err(e) => {
                LOADER_CYCLES.with_label_values(&["error"]).inc();
                self.restart_strategy(&e).await;
                CycleOutcome::Idle
            }
        }
    }

    async fn restart_strategy(&self, cause: &IngestionError) {
        let strategy = self.strategy.name();
        tracing::warn!(
            %strategy,
            error = %cause,
            last_height = self.buffer.last_height(),
            "[qc-18] Loader cycle failed, restarting strategy"
        );
        if let Err(e) = self.strategy.stop().await {
            tracing::warn!(%strategy, error = %e, "[qc-18] Strategy stop failed");
        }
        let _ = self.events.send(IngestionEvent::LoaderRestarted {
            strategy: strategy.to_string(),
            reason: cause.to_string(),
        });
    }
}

/// Drives the active strategy on a polling interval.
pub struct Loader {
    inner: Arc<LoaderInner>,
    poll: PollInterval,
    task: Mutex<Option<PollingTask>>,
}

impl Loader {
    /// Create a stopped loader.
    pub fn new(
        strategy: Arc<dyn LoadStrategy>,
        upstream: Arc<dyn UpstreamSource>,
        buffer: Arc<BlockBuffer>,
        poll: PollInterval,
        events: broadcast::Sender<IngestionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                strategy,
                upstream,
                buffer,
                events,
            }),
            poll,
            task: Mutex::new(None),
        }
    }

    /// Active strategy name.
    pub fn strategy(&self) -> LoaderStrategyName {
        self.inner.strategy.name()
    }

    /// Spawn the polling task.
    ///
    /// # Errors
    /// `AlreadyRunning` if the task is running.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Err(IngestionError::AlreadyRunning("loader"));
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(PollingTask::spawn("loader", self.poll.clone(), move |_| {
            let inner = Arc::clone(&inner);
            async move { inner.cycle().await }
        }));
        tracing::info!(
            strategy = %self.inner.strategy.name(),
            from_height = self.inner.buffer.last_height() + 1,
            "[qc-18] Loader started"
        );
        Ok(())
    }

    /// Stop the polling task, letting an in-flight cycle finish, then stop
    /// the strategy.
    pub async fn stop(&self) -> Result<()> {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
            tracing::info!(strategy = %self.inner.strategy.name(), "[qc-18] Loader stopped");
        }
        self.inner.strategy.stop().await
    }

    /// Whether the polling task is running.
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Run a single cycle inline.
    pub async fn run_once(&self) -> CycleOutcome {
        self.inner.cycle().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{build_chain, InMemoryUpstream};
    use crate::domain::BufferLimits;
    use std::time::Duration;

    fn buffer(max_count: usize) -> Arc<BlockBuffer> {
        Arc::new(BlockBuffer::new(
            BufferLimits {
                max_count,
                max_bytes: 1 << 20,
                max_height: None,
            },
            -1,
        ))
    }

    fn loader(
        upstream: Arc<InMemoryUpstream>,
        buffer: Arc<BlockBuffer>,
    ) -> (Loader, broadcast::Receiver<IngestionEvent>) {
        let (events, rx) = broadcast::channel(16);
        let strategy = Arc::new(ByBatches::new(
            Arc::clone(&buffer),
            upstream.clone() as Arc<dyn UpstreamSource>,
            5,
        ));
        let poll = PollInterval::new(Duration::from_millis(10), 2.0, Duration::from_millis(80));
        (Loader::new(strategy, upstream, buffer, poll, events), rx)
    }

    #[test]
    fn test_enqueue_ordered_skips_stale_and_sorts() {
        let buffer = buffer(100);
        buffer.reset(1);
        let mut blocks = build_chain(0, 5, "A", "", 1);
        blocks.reverse();
        let report = enqueue_ordered(&buffer, blocks, LoaderStrategyName::ByBatches);
        assert_eq!(report.accepted, 4);
        assert!(report.rejection.is_none());
        assert_eq!(buffer.last_height(), 5);
    }

    #[test]
    fn test_enqueue_ordered_stops_at_gap() {
        let buffer = buffer(100);
        let mut blocks = build_chain(0, 5, "A", "", 1);
        blocks.remove(3);
        let report = enqueue_ordered(&buffer, blocks, LoaderStrategyName::ByBatches);
        assert_eq!(report.accepted, 3);
        assert!(matches!(report.rejection, Some(Rejection::HeightMismatch { expected: 3, got: 4 })));
        assert_eq!(buffer.last_height(), 2);
    }

    #[test]
    fn test_enqueue_ordered_reports_immediate_rejection() {
        let buffer = buffer(100);
        let blocks = build_chain(3, 4, "A", "A2", 1);
        let report = enqueue_ordered(&buffer, blocks, LoaderStrategyName::ByBatches);
        assert_eq!(report.accepted, 0);
        assert!(matches!(report.rejection, Some(Rejection::HeightMismatch { expected: 0, got: 3 })));
    }

    #[test]
    fn test_enqueue_ordered_stops_at_malformed_block() {
        let buffer = buffer(100);
        let mut blocks = build_chain(0, 3, "A", "", 1);
        blocks[2].transactions.clear();
        let report = enqueue_ordered(&buffer, blocks, LoaderStrategyName::ByWorkers);
        assert_eq!(report.accepted, 2);
        assert_eq!(report.rejection, Some(Rejection::InvalidBlock { height: 2 }));
        assert_eq!(buffer.last_height(), 1);
    }

    #[tokio::test]
    async fn test_cycle_outcomes() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 6, "A", "", 1)));
        let buffer = buffer(100);
        let (loader, _) = loader(Arc::clone(&upstream), Arc::clone(&buffer));

        assert_eq!(loader.run_once().await, CycleOutcome::Progress);
        assert_eq!(buffer.last_height(), 4);
        assert_eq!(loader.run_once().await, CycleOutcome::Progress);
        assert_eq!(buffer.last_height(), 6);
        assert_eq!(loader.run_once().await, CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn test_full_buffer_skips_cycle_without_upstream_call() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 9, "A", "", 1)));
        let buffer = buffer(2);
        let (loader, _) = loader(Arc::clone(&upstream), Arc::clone(&buffer));

        loader.run_once().await;
        assert!(buffer.is_full());
        let calls = upstream.call_count();
        assert_eq!(loader.run_once().await, CycleOutcome::Idle);
        assert_eq!(upstream.call_count(), calls);
    }

    #[tokio::test]
    async fn test_failure_publishes_restart() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 3, "A", "", 1)));
        let buffer = buffer(100);
        let (loader, mut events) = loader(Arc::clone(&upstream), Arc::clone(&buffer));

        upstream.fail_next(1);
        assert_eq!(loader.run_once().await, CycleOutcome::Idle);
        match events.try_recv().unwrap() {
            IngestionEvent::LoaderRestarted { strategy, reason } => {
                assert_eq!(strategy, "by-batches");
                assert!(reason.contains("injected"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(loader.run_once().await, CycleOutcome::Progress);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 20, "A", "", 1)));
        let buffer = buffer(100);
        let (loader, _) = loader(Arc::clone(&upstream), Arc::clone(&buffer));

        loader.start().unwrap();
        assert!(matches!(loader.start(), Err(IngestionError::AlreadyRunning(_))));
        tokio::time::timeout(Duration::from_secs(5), async {
            while buffer.last_height() < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        loader.stop().await.unwrap();
        assert!(!loader.is_running());
        loader.start().unwrap();
        loader.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_height_ceiling_caps_target() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 20, "A", "", 1)));
        let buffer = Arc::new(BlockBuffer::new(
            BufferLimits {
                max_count: 100,
                max_bytes: 1 << 20,
                max_height: Some(7),
            },
            -1,
        ));
        let (loader, _) = loader(Arc::clone(&upstream), Arc::clone(&buffer));
        while loader.run_once().await == CycleOutcome::Progress {}
        assert_eq!(buffer.last_height(), 7);
        assert!(buffer.is_max_height_reached());
    }
}
