//! # Reorganisation and Fault Tests for Block Ingestion (qc-18)
//!
//! Forks injected into a running pipeline, divergence deeper than the
//! ledger window and acknowledgement desynchronisation.

mod common;

use common::{wait_until, Pipeline, TX_BYTES};
use qc_18_block_ingestion::{
    build_chain, find_fork_point, IngestionApi, IngestionConfig, IngestionError, IngestionEvent,
    InMemoryUpstream, LoaderStrategyName, ReorgState,
};
use shared_types::LightBlock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

fn upstream(tip: u64) -> Arc<InMemoryUpstream> {
    Arc::new(InMemoryUpstream::with_chain(build_chain(0, tip, "A", "", TX_BYTES)))
}

async fn fork_while_running(strategy: LoaderStrategyName, depth: u64, expected_steps: usize) {
    let upstream = upstream(19);
    let mut pipeline = Pipeline::new(
        IngestionConfig::for_testing().with_strategy(strategy),
        Arc::clone(&upstream),
    );
    pipeline.start().await;
    pipeline.wait_for_tip(19).await;

    let fork_height = 19 - depth;
    upstream.replace_from(
        fork_height + 1,
        build_chain(fork_height + 1, 30, "B", &format!("A{fork_height}"), TX_BYTES),
    );
    let service = Arc::clone(&pipeline.service);
    wait_until(move || {
        service
            .ledger_blocks()
            .last()
            .is_some_and(|tip| tip.hash == "B30")
    })
    .await;

    let hashes = pipeline.ledger_hashes();
    assert_eq!(hashes.len(), 31);
    assert_eq!(hashes[fork_height as usize], format!("A{fork_height}"));
    assert_eq!(hashes[fork_height as usize + 1], format!("B{}", fork_height + 1));
    assert_eq!(pipeline.service.status().reorg_state, ReorgState::Normal);

    let events = pipeline.drain_events();
    let progress_steps = events
        .iter()
        .filter(|e| matches!(e, IngestionEvent::ReorgProgress { .. }))
        .count();
    assert_eq!(progress_steps, expected_steps);
    assert!(events.contains(&IngestionEvent::ReorgCompleted {
        fork_height: fork_height as i64,
        depth: depth as usize,
    }));
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_shallow_fork_by_batches() {
    fork_while_running(LoaderStrategyName::ByBatches, 1, 0).await;
}

#[tokio::test]
async fn test_fork_preload_then_fetch() {
    fork_while_running(LoaderStrategyName::PreloadThenFetch, 5, 0).await;
}

#[tokio::test]
async fn test_deep_fork_is_applied_in_steps() {
    // for_testing splits rollbacks every 10 blocks.
    fork_while_running(LoaderStrategyName::ByWorkers, 15, 1).await;
}

#[tokio::test]
async fn test_fork_point_scenario() {
    let local: Vec<LightBlock> = build_chain(0, 4, "L", "", 1)
        .iter()
        .map(LightBlock::from)
        .collect();
    let mut remote = build_chain(0, 3, "L", "", 1);
    remote.extend(build_chain(4, 4, "U", "L3", 1));
    let upstream = InMemoryUpstream::with_chain(remote);

    let fork = find_fork_point(&local, &upstream).await.unwrap();
    assert_eq!(fork.fork_height, 3);
    assert_eq!(fork.invalidated.len(), 1);
    assert_eq!(fork.invalidated[0].hash, "L4");
}

#[tokio::test]
async fn test_divergence_beyond_window_halts() {
    let mut config = IngestionConfig::for_testing();
    config.ledger_window_size = 5;
    let upstream = upstream(19);
    let mut pipeline = Pipeline::new(config, Arc::clone(&upstream));
    pipeline.start().await;
    pipeline.wait_for_tip(19).await;

    upstream.replace_from(5, build_chain(5, 30, "B", "A4", TX_BYTES));
    let reason = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match pipeline.events.recv().await {
                Ok(IngestionEvent::Fatal { reason }) => break reason,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("no fatal event");
    assert!(reason.contains("diverged"));

    let status = pipeline.service.status();
    assert_eq!(status.reorg_state, ReorgState::Reorganising);
    assert_eq!(status.ledger_tip_height, Some(19));
    assert!(!status.loader_running);
    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_wrong_acknowledgement_desynchronises() {
    let pipeline = Pipeline::new(IngestionConfig::for_testing(), upstream(9));
    pipeline.service.buffer().enqueue(build_chain(0, 0, "A", "", TX_BYTES).remove(0)).unwrap();

    let err = pipeline
        .service
        .confirm_batch(&["X0".to_string()])
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    match err {
        IngestionError::Desynchronized { expected, found } => {
            assert_eq!(expected, "X0");
            assert_eq!(found.as_deref(), Some("A0"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(pipeline.service.buffer().len(), 1);
    pipeline.shutdown().await;
}
