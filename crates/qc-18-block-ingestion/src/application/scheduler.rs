//! # Polling Scheduler
//!
//! Runs an async cycle on an exponential interval. The interval resets after
//! a cycle that made progress and grows after an idle one. Cancellation is
//! observed between cycles only; a cycle that has started always finishes.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PollConfig;

/// Result of one polling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Work was done; poll again soon.
    Progress,
    /// Nothing to do; back off.
    Idle,
    /// The task cannot continue and exits.
    Halt,
}

/// Exponentially growing interval.
#[derive(Debug, Clone, PartialEq)]
pub struct PollInterval {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    current: Duration,
}

impl PollInterval {
    /// Create an interval starting at `initial`.
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            multiplier: multiplier.max(1.0),
            max,
            current: initial,
        }
    }

    /// Interval that will be used next.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Back to the initial interval.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Delay before the next cycle given this cycle's outcome.
    pub fn next_delay(&mut self, outcome: CycleOutcome) -> Duration {
        if outcome == CycleOutcome::Progress {
            self.reset();
            return self.current;
        }
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        delay
    }
}

impl From<&PollConfig> for PollInterval {
    fn from(config: &PollConfig) -> Self {
        Self::new(config.initial(), config.multiplier, config.max())
    }
}

/// A spawned polling loop.
#[derive(Debug)]
pub struct PollingTask {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollingTask {
    /// Spawn `cycle` on `interval` until cancelled or halted.
    pub fn spawn<F, Fut>(name: &'static str, interval: PollInterval, cycle: F) -> Self
    where
        F: FnMut(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = CycleOutcome> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_polling(name, interval, token.clone(), cycle));
        Self {
            name,
            token,
            handle,
        }
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel without waiting. No further cycle starts.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the in-flight cycle to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, error = %e, "[qc-18] Polling task terminated abnormally");
        }
    }
}

/// Polling loop body.
///
/// The cycle receives the token so that waits inside it can end early.
pub async fn run_polling<F, Fut>(
    name: &'static str,
    mut interval: PollInterval,
    token: CancellationToken,
    mut cycle: F,
) where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = CycleOutcome>,
{
    tracing::debug!(task = name, "[qc-18] Polling task started");
    while !token.is_cancelled() {
        let outcome = cycle(token.clone()).await;
        if outcome == CycleOutcome::Halt {
            tracing::warn!(task = name, "[qc-18] Polling task halted");
            break;
        }
        let delay = interval.next_delay(outcome);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    tracing::debug!(task = name, "[qc-18] Polling task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn interval() -> PollInterval {
        PollInterval::new(Duration::from_millis(100), 2.0, Duration::from_millis(1000))
    }

    #[test]
    fn test_idle_grows_to_max() {
        let mut poll = interval();
        let delays: Vec<u64> = (0..6)
            .map(|_| poll.next_delay(CycleOutcome::Idle).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_progress_resets() {
        let mut poll = interval();
        poll.next_delay(CycleOutcome::Idle);
        poll.next_delay(CycleOutcome::Idle);
        assert_eq!(poll.current(), Duration::from_millis(400));
        assert_eq!(poll.next_delay(CycleOutcome::Progress), Duration::from_millis(100));
        assert_eq!(poll.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_from_config() {
        let poll = PollInterval::from(&PollConfig {
            initial_ms: 50,
            multiplier: 2.0,
            max_ms: 5000,
        });
        assert_eq!(poll.current(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = PollingTask::spawn("test", interval(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                CycleOutcome::Progress
            }
        });

        tokio::time::sleep(Duration::from_millis(450)).await;
        task.stop().await;
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 4, "ran {seen} times");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_cycle_completes_on_stop() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        let task = PollingTask::spawn("slow", interval(), move |_| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                CycleOutcome::Idle
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop().await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_halt_ends_task() {
        let task = PollingTask::spawn("halting", interval(), |_| async { CycleOutcome::Halt });
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_secs(1), async {
                while !task.is_finished() {
                    tokio::task::yield_now().await;
                }
            })
            .await
        );
    }
}
