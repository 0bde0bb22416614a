//! Shared harness for the pipeline tests.

#![allow(dead_code)]

use qc_18_block_ingestion::{
    BatchConsumer, BlockBatch, BlockStream, ChannelConsumer, InMemoryUpstream, IngestionApi,
    IngestionConfig, IngestionEvent, IngestionService, UpstreamSource,
};
use quantum_telemetry::{TelemetryConfig, TelemetryGuard};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub const TX_BYTES: usize = 16;

static TELEMETRY: OnceLock<Option<TelemetryGuard>> = OnceLock::new();

/// Install logging once per test binary. Output is shown only when
/// `QC_LOG_LEVEL` is set.
pub fn init_test_telemetry() {
    TELEMETRY.get_or_init(|| {
        let config = TelemetryConfig {
            console_output: std::env::var("QC_LOG_LEVEL").is_ok(),
            ..qc_18_block_ingestion::telemetry_config()
        };
        qc_18_block_ingestion::init_telemetry(config).ok()
    });
}

pub struct Pipeline {
    pub service: Arc<IngestionService>,
    pub upstream: Arc<InMemoryUpstream>,
    pub consumer: Arc<ChannelConsumer>,
    pub events: broadcast::Receiver<IngestionEvent>,
    applier: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Service over `upstream` whose batches are applied with `process_batch`
    /// by a background task.
    pub fn new(config: IngestionConfig, upstream: Arc<InMemoryUpstream>) -> Self {
        init_test_telemetry();
        let (consumer, batches) = ChannelConsumer::new(4);
        let consumer = Arc::new(consumer);
        let service = Arc::new(
            IngestionService::new(
                config,
                Arc::clone(&upstream) as Arc<dyn UpstreamSource>,
                Arc::clone(&consumer) as Arc<dyn BatchConsumer>,
                Some(Arc::clone(&upstream) as Arc<dyn BlockStream>),
            )
            .expect("valid config"),
        );
        let events = service.subscribe();
        let applier = Some(spawn_applier(Arc::clone(&service), batches));
        Self {
            service,
            upstream,
            consumer,
            events,
            applier,
        }
    }

    pub async fn start(&self) {
        self.service.start().await.expect("start");
    }

    pub async fn shutdown(mut self) {
        self.service.stop().await.expect("stop");
        if let Some(applier) = self.applier.take() {
            applier.abort();
        }
    }

    pub async fn wait_for_tip(&self, height: i64) {
        let service = Arc::clone(&self.service);
        wait_until(move || service.ledger_tip_height() >= height).await;
    }

    pub fn ledger_heights(&self) -> Vec<u64> {
        self.service
            .ledger_blocks()
            .iter()
            .map(|b| b.height)
            .collect()
    }

    pub fn ledger_hashes(&self) -> Vec<String> {
        self.service
            .ledger_blocks()
            .into_iter()
            .map(|b| b.hash)
            .collect()
    }

    /// Every event published so far.
    pub fn drain_events(&mut self) -> Vec<IngestionEvent> {
        let mut seen = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => seen.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        seen
    }
}

fn spawn_applier(
    service: Arc<IngestionService>,
    mut batches: mpsc::Receiver<BlockBatch>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batches.recv().await {
            if let Err(e) = service.process_batch(&batch).await {
                if e.is_fatal() {
                    break;
                }
            }
        }
    })
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
