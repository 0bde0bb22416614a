//! # Retry
//!
//! Per-operation retry used inside a loader cycle. Independent of the outer
//! polling interval, which only decides when the next cycle starts.

use backon::{ConstantBuilder, ExponentialBuilder, Retryable};
use quantum_telemetry::FETCH_RETRIES;
use std::future::Future;
use std::time::Duration;

use crate::domain::{IngestionError, Result};

/// Attempts made by every built-in policy.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// How long to wait between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// `base`, `2 × base`, `4 × base`, ...
    Exponential {
        /// Total attempts.
        attempts: u32,
        /// First delay.
        base: Duration,
    },
    /// Same delay after every failure.
    Fixed {
        /// Total attempts.
        attempts: u32,
        /// Delay.
        delay: Duration,
    },
}

impl RetryPolicy {
    /// 3 attempts, 100ms doubling. Used per height by the worker strategy.
    pub const fn worker_default() -> Self {
        RetryPolicy::Exponential {
            attempts: DEFAULT_ATTEMPTS,
            base: Duration::from_millis(100),
        }
    }

    /// 3 attempts, 50ms apart. Used per fetch group by the preload strategy.
    pub const fn preload_default() -> Self {
        RetryPolicy::Fixed {
            attempts: DEFAULT_ATTEMPTS,
            delay: Duration::from_millis(50),
        }
    }

    /// Total attempts.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryPolicy::Exponential { attempts, .. } | RetryPolicy::Fixed { attempts, .. } => {
                (*attempts).max(1)
            }
        }
    }

    fn retries(&self) -> usize {
        (self.attempts() - 1) as usize
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// `strategy` labels the retry counter.
///
/// # Errors
/// `RetriesExhausted` carrying the last error message.
pub async fn retry_with_policy<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    strategy: &str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let notify = |e: &IngestionError, delay: Duration| {
        tracing::debug!(
            operation,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "[qc-18] Retrying"
        );
        FETCH_RETRIES.with_label_values(&[strategy]).inc();
    };

    let result = match policy {
        RetryPolicy::Exponential { base, .. } => {
            let backoff = ExponentialBuilder::default()
                .with_min_delay(base)
                .with_factor(2.0)
                .with_max_times(policy.retries());
            op.retry(backoff).notify(notify).await
        }
        RetryPolicy::Fixed { delay, .. } => {
            let backoff = ConstantBuilder::default()
                .with_delay(delay)
                .with_max_times(policy.retries());
            op.retry(backoff).notify(notify).await
        }
    };

    result.map_err(|e| {
        let attempts = policy.attempts();
        tracing::warn!(
            operation,
            attempts,
            error = %e,
            "[qc-18] Retries exhausted"
        );
        IngestionError::RetriesExhausted {
            operation: operation.to_string(),
            attempts,
            last_error: e.to_string(),
        }
    })
}
