//! # Reorg Coordinator
//!
//! Owns the `Normal` / `Reorganising` state machine.
//!
//! `plan` finds the fork point against the upstream and slices the rollback
//! into signals; `apply` executes one signal against the ledger and buffer.
//! Applying a signal twice leaves the same state as applying it once.

use parking_lot::RwLock;
use quantum_telemetry::{REORGS, REORG_DEPTH};
use shared_types::LightBlock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::algorithms::{find_fork_point, split_reorg};
use crate::domain::{BlockBuffer, ChainLedger, ReorgSignal, ReorgState, Result};
use crate::ports::UpstreamSource;

/// Planned rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgPlan {
    /// Fork height (-1 if the chains share nothing).
    pub fork_height: i64,
    /// Total blocks invalidated.
    pub depth: usize,
    /// Signals to apply in order; the last one is terminal.
    pub signals: Vec<ReorgSignal>,
}

/// Fork detection and rollback.
pub struct ReorgCoordinator {
    upstream: Arc<dyn UpstreamSource>,
    split_threshold: usize,
    state: RwLock<ReorgState>,
    pending_depth: AtomicUsize,
}

impl ReorgCoordinator {
    /// Create a coordinator in `Normal` state.
    pub fn new(upstream: Arc<dyn UpstreamSource>, split_threshold: usize) -> Self {
        Self {
            upstream,
            split_threshold: split_threshold.max(1),
            state: RwLock::new(ReorgState::Normal),
            pending_depth: AtomicUsize::new(0),
        }
    }

    /// Current state.
    pub fn state(&self) -> ReorgState {
        *self.state.read()
    }

    /// Enter `Reorganising` and plan the rollback of `local` (oldest first).
    ///
    /// # Errors
    /// `DivergenceBeyondWindow` (state stays `Reorganising`) or an upstream
    /// error (state returns to `Normal` so the caller may retry).
    pub async fn plan(&self, local: &[LightBlock]) -> Result<ReorgPlan> {
        *self.state.write() = ReorgState::Reorganising;
        tracing::warn!(
            local_tip = local.last().map(|b| b.height),
            window = local.len(),
            "[qc-18] Chain discontinuity, searching for fork point"
        );

        let fork = match find_fork_point(local, self.upstream.as_ref()).await {
            Ok(fork) => fork,
            Err(e) => {
                if !e.is_fatal() {
                    *self.state.write() = ReorgState::Normal;
                }
                return Err(e);
            }
        };

        let depth = fork.depth();
        self.pending_depth.store(depth, Ordering::SeqCst);
        let signals = split_reorg(fork.invalidated, fork.fork_height, self.split_threshold);
        tracing::info!(
            fork_height = fork.fork_height,
            depth,
            steps = signals.len(),
            "[qc-18] Reorg planned"
        );
        Ok(ReorgPlan {
            fork_height: fork.fork_height,
            depth,
            signals,
        })
    }

    /// Apply one signal.
    ///
    /// `InProgress` truncates the ledger. `Completed` truncates it to the
    /// fork height, reseeds the buffer there and returns to `Normal`.
    /// Callers hold the ledger lock for the duration so no block can be
    /// enqueued between truncation and reseed.
    pub fn apply(&self, signal: &ReorgSignal, ledger: &mut ChainLedger, buffer: &BlockBuffer) {
        let target = signal.target_height();
        if !ledger.truncate_to_height(target) {
            tracing::warn!(
                target,
                ledger_head = ledger.head().map(|b| b.height),
                "[qc-18] Truncation target below retained ledger"
            );
        }

        match signal {
            ReorgSignal::InProgress { invalidated, .. } => {
                tracing::debug!(
                    truncate_to = target,
                    invalidated = invalidated.len(),
                    "[qc-18] Reorg step applied"
                );
            }
            ReorgSignal::Completed { fork_height, .. } => {
                buffer.reset(*fork_height);
                let previous = std::mem::replace(&mut *self.state.write(), ReorgState::Normal);
                if previous == ReorgState::Reorganising {
                    let depth = self.pending_depth.swap(0, Ordering::SeqCst);
                    REORGS.inc();
                    REORG_DEPTH.observe(depth as f64);
                    tracing::info!(
                        fork_height,
                        depth,
                        "[qc-18] Reorg completed, resuming from fork point"
                    );
                }
            }
        }
    }
}
