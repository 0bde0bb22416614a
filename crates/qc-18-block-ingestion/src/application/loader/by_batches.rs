//! By-batches strategy: one contiguous range request per cycle.

use async_trait::async_trait;
use std::sync::Arc;

use super::{enqueue_ordered, LoadStrategy};
use crate::config::LoaderStrategyName;
use crate::domain::{BlockBuffer, BlockDetail, Result};
use crate::ports::UpstreamSource;

/// Requests `[last + 1 ..= last + batch_length]` in a single call.
pub struct ByBatches {
    buffer: Arc<BlockBuffer>,
    upstream: Arc<dyn UpstreamSource>,
    batch_length: usize,
}

impl ByBatches {
    /// Create the strategy.
    pub fn new(
        buffer: Arc<BlockBuffer>,
        upstream: Arc<dyn UpstreamSource>,
        batch_length: usize,
    ) -> Self {
        Self {
            buffer,
            upstream,
            batch_length: batch_length.max(1),
        }
    }
}

#[async_trait]
impl LoadStrategy for ByBatches {
    fn name(&self) -> LoaderStrategyName {
        LoaderStrategyName::ByBatches
    }

    async fn load(&self, target_height: u64) -> Result<bool> {
        let next = (self.buffer.last_height() + 1) as u64;
        if next > target_height {
            return Ok(false);
        }
        let last = target_height.min(next + self.batch_length as u64 - 1);
        let heights: Vec<u64> = (next..=last).collect();

        let blocks = self
            .upstream
            .get_many_blocks_by_heights(&heights, BlockDetail::Full)
            .await?;
        tracing::debug!(
            from = next,
            to = last,
            received = blocks.len(),
            "[qc-18] by-batches fetched range"
        );

        let report = enqueue_ordered(&self.buffer, blocks, self.name());
        Ok(report.accepted > 0)
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{build_chain, InMemoryUpstream};
    use crate::domain::BufferLimits;

    #[tokio::test]
    async fn test_loads_fixed_runs() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 11, "A", "", 3)));
        let buffer = Arc::new(BlockBuffer::new(BufferLimits::default(), -1));
        let strategy = ByBatches::new(Arc::clone(&buffer), upstream, 4);

        assert!(strategy.load(11).await.unwrap());
        assert_eq!(buffer.last_height(), 3);
        assert!(strategy.load(11).await.unwrap());
        assert!(strategy.load(11).await.unwrap());
        assert_eq!(buffer.last_height(), 11);
        assert!(!strategy.load(11).await.unwrap());
    }

    #[tokio::test]
    async fn test_stops_at_first_rejection() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 9, "A", "", 10)));
        let buffer = Arc::new(BlockBuffer::new(
            BufferLimits {
                max_count: 100,
                max_bytes: 35,
                max_height: None,
            },
            -1,
        ));
        let strategy = ByBatches::new(Arc::clone(&buffer), upstream, 10);

        assert!(strategy.load(9).await.unwrap());
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.last_height(), 2);
    }

    #[tokio::test]
    async fn test_malformed_upstream_blocks_rejected() {
        let mut chain = build_chain(0, 1, "A", "", 5000);
        chain[0].transactions.clear();
        chain[1].size_bytes = 0;
        let upstream = Arc::new(InMemoryUpstream::with_chain(chain));
        let buffer = Arc::new(BlockBuffer::new(
            BufferLimits {
                max_count: 100,
                max_bytes: 100,
                max_height: None,
            },
            -1,
        ));
        let strategy = ByBatches::new(Arc::clone(&buffer), upstream, 4);

        assert!(!strategy.load(1).await.unwrap());
        assert!(buffer.is_empty());
        assert_eq!(buffer.current_bytes(), 0);
    }

    #[tokio::test]
    async fn test_understated_size_counts_real_bytes() {
        let mut chain = build_chain(0, 1, "A", "", 60);
        chain[1].size_bytes = 0;
        let upstream = Arc::new(InMemoryUpstream::with_chain(chain));
        let buffer = Arc::new(BlockBuffer::new(
            BufferLimits {
                max_count: 100,
                max_bytes: 100,
                max_height: None,
            },
            -1,
        ));
        let strategy = ByBatches::new(Arc::clone(&buffer), upstream, 4);

        assert!(strategy.load(1).await.unwrap());
        assert_eq!(buffer.last_height(), 0);
        assert_eq!(buffer.current_bytes(), 60);
    }

    #[tokio::test]
    async fn test_upstream_error_propagates() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 3, "A", "", 1)));
        upstream.fail_next(1);
        let buffer = Arc::new(BlockBuffer::new(BufferLimits::default(), -1));
        let strategy = ByBatches::new(Arc::clone(&buffer), upstream, 4);
        assert!(strategy.load(3).await.is_err());
        assert!(buffer.is_empty());
    }
}
