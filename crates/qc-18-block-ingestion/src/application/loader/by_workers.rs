//! By-workers strategy: one request per height across a worker pool.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;

use super::{enqueue_ordered, LoadStrategy};
use crate::algorithms::{retry_with_policy, RetryPolicy};
use crate::config::LoaderStrategyName;
use crate::domain::{BlockBuffer, BlockDetail, Result};
use crate::ports::UpstreamSource;

/// Fetches up to `worker_count` heights in parallel, each with its own
/// exponential retry.
pub struct ByWorkers {
    buffer: Arc<BlockBuffer>,
    upstream: Arc<dyn UpstreamSource>,
    worker_count: usize,
    retry: RetryPolicy,
}

impl ByWorkers {
    /// Create the strategy with the default retry policy.
    pub fn new(
        buffer: Arc<BlockBuffer>,
        upstream: Arc<dyn UpstreamSource>,
        worker_count: usize,
    ) -> Self {
        Self {
            buffer,
            upstream,
            worker_count: worker_count.max(1),
            retry: RetryPolicy::worker_default(),
        }
    }

    /// Override the per-height retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl LoadStrategy for ByWorkers {
    fn name(&self) -> LoaderStrategyName {
        LoaderStrategyName::ByWorkers
    }

    async fn load(&self, target_height: u64) -> Result<bool> {
        let next = (self.buffer.last_height() + 1) as u64;
        if next > target_height {
            return Ok(false);
        }
        let capacity = self.buffer.remaining_capacity().max(1);
        let count = self.worker_count.min(capacity) as u64;
        let last = target_height.min(next + count - 1);

        let retry = self.retry;
        let results: Vec<Result<_>> = stream::iter(next..=last)
            .map(|height| {
                let upstream = Arc::clone(&self.upstream);
                async move {
                    retry_with_policy(retry, "get_one_block_by_height", "by-workers", || {
                        let upstream = Arc::clone(&upstream);
                        async move {
                            upstream
                                .get_one_block_by_height(height, BlockDetail::Full)
                                .await
                        }
                    })
                    .await
                }
            })
            .buffer_unordered(self.worker_count)
            .collect()
            .await;

        let blocks = results.into_iter().collect::<Result<Vec<_>>>()?;
        let report = enqueue_ordered(&self.buffer, blocks, self.name());
        Ok(report.accepted > 0)
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}
