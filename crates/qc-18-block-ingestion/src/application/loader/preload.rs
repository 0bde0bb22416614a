//! Preload-then-fetch strategy.
//!
//! Phase 1 preloads hash and size metadata for upcoming heights into a queue
//! (skipped while entries remain). Phase 2 splits the queue into concurrent
//! byte-bounded groups, fetches them by hash and enqueues the merged result
//! lowest height first.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use super::{enqueue_ordered, LoadStrategy};
use crate::algorithms::{group_preloaded, retry_with_policy, RetryPolicy};
use crate::config::LoaderStrategyName;
use crate::domain::{BlockBuffer, BlockDetail, PreloadedBlockInfo, Result};
use crate::ports::UpstreamSource;

/// Size-aware concurrent loader.
pub struct PreloadThenFetch {
    buffer: Arc<BlockBuffer>,
    upstream: Arc<dyn UpstreamSource>,
    preload_count: usize,
    concurrency: usize,
    max_bytes_per_request: u64,
    retry: RetryPolicy,
    queue: Mutex<VecDeque<PreloadedBlockInfo>>,
}

impl PreloadThenFetch {
    /// Create the strategy with the default retry policy.
    pub fn new(
        buffer: Arc<BlockBuffer>,
        upstream: Arc<dyn UpstreamSource>,
        preload_count: usize,
        concurrency: usize,
        max_bytes_per_request: u64,
    ) -> Self {
        Self {
            buffer,
            upstream,
            preload_count: preload_count.max(1),
            concurrency: concurrency.max(1),
            max_bytes_per_request: max_bytes_per_request.max(1),
            retry: RetryPolicy::preload_default(),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Entries waiting in the preload queue.
    pub fn preloaded(&self) -> usize {
        self.queue.lock().len()
    }

    async fn preload(&self, target_height: u64) -> Result<()> {
        if !self.queue.lock().is_empty() {
            return Ok(());
        }
        let next = (self.buffer.last_height() + 1) as u64;
        if next > target_height {
            return Ok(());
        }
        let last = target_height.min(next + self.preload_count as u64 - 1);
        let heights: Vec<u64> = (next..=last).collect();

        let mut infos = self
            .upstream
            .get_many_block_stats_by_heights(&heights)
            .await?;
        infos.sort_by_key(|i| i.height);
        tracing::debug!(
            from = next,
            to = last,
            preloaded = infos.len(),
            "[qc-18] Preloaded block metadata"
        );
        self.queue.lock().extend(infos);
        Ok(())
    }
}

#[async_trait]
impl LoadStrategy for PreloadThenFetch {
    fn name(&self) -> LoaderStrategyName {
        LoaderStrategyName::PreloadThenFetch
    }

    async fn load(&self, target_height: u64) -> Result<bool> {
        self.preload(target_height).await?;

        let budget = self
            .max_bytes_per_request
            .saturating_mul(self.concurrency as u64);
        if self.buffer.is_overloaded(budget) {
            tracing::debug!(
                current_bytes = self.buffer.current_bytes(),
                budget,
                "[qc-18] Buffer overloaded, skipping fetch"
            );
            return Ok(false);
        }

        let groups = group_preloaded(
            &mut self.queue.lock(),
            self.concurrency,
            self.max_bytes_per_request,
            self.buffer.last_height(),
        );
        if groups.is_empty() {
            return Ok(false);
        }

        let fetches = groups.into_iter().map(|group| {
            let upstream = Arc::clone(&self.upstream);
            let hashes: Vec<_> = group.into_iter().map(|i| i.hash).collect();
            let retry = self.retry;
            async move {
                retry_with_policy(retry, "get_many_blocks_by_hashes", "preload-then-fetch", || {
                    let upstream = Arc::clone(&upstream);
                    let hashes = hashes.clone();
                    async move {
                        upstream
                            .get_many_blocks_by_hashes(&hashes, BlockDetail::Full)
                            .await
                    }
                })
                .await
            }
        });

        let mut blocks = Vec::new();
        for result in join_all(fetches).await {
            match result {
                Ok(fetched) => blocks.extend(fetched),
                Err(e) => {
                    self.queue.lock().clear();
                    return Err(e);
                }
            }
        }

        let report = enqueue_ordered(&self.buffer, blocks, self.name());
        if report.rejection.is_some() {
            // Popped entries beyond the rejection are gone; preload again.
            self.queue.lock().clear();
        }
        Ok(report.accepted > 0)
    }

    async fn stop(&self) -> Result<()> {
        self.queue.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{build_chain, InMemoryUpstream};
    use crate::domain::BufferLimits;

    fn strategy(
        upstream: Arc<InMemoryUpstream>,
        buffer: Arc<BlockBuffer>,
    ) -> PreloadThenFetch {
        // 10-byte blocks, two groups of at most three blocks each.
        PreloadThenFetch::new(buffer, upstream, 8, 2, 30)
    }

    fn buffer(max_bytes: u64) -> Arc<BlockBuffer> {
        Arc::new(BlockBuffer::new(
            BufferLimits {
                max_count: 1000,
                max_bytes,
                max_height: None,
            },
            -1,
        ))
    }

    #[tokio::test]
    async fn test_preload_then_fetch_in_groups() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 19, "A", "", 10)));
        let buffer = buffer(10_000);
        let strategy = strategy(Arc::clone(&upstream), Arc::clone(&buffer));

        assert!(strategy.load(19).await.unwrap());
        assert_eq!(buffer.last_height(), 5);
        assert_eq!(strategy.preloaded(), 2);

        // Queue not empty: no new preload, remaining two are fetched.
        assert!(strategy.load(19).await.unwrap());
        assert_eq!(buffer.last_height(), 7);
        assert_eq!(strategy.preloaded(), 0);

        while strategy.load(19).await.unwrap() {}
        assert_eq!(buffer.last_height(), 19);
    }

    #[tokio::test]
    async fn test_overload_gate_skips_fetch() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 19, "A", "", 10)));
        let buffer = buffer(100);
        let strategy = strategy(Arc::clone(&upstream), Arc::clone(&buffer));

        assert!(strategy.load(19).await.unwrap());
        // 60 bytes buffered; another 2 x 30 would exceed 100.
        assert_eq!(buffer.current_bytes(), 60);
        assert!(!strategy.load(19).await.unwrap());
        assert_eq!(buffer.last_height(), 5);
        assert_eq!(strategy.preloaded(), 2);

        while buffer.current_bytes() > 40 {
            buffer.dequeue();
        }
        assert!(strategy.load(19).await.unwrap());
        assert_eq!(buffer.last_height(), 7);
    }

    #[tokio::test]
    async fn test_stale_preloads_skipped() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 19, "A", "", 10)));
        let buffer = buffer(10_000);
        let strategy = strategy(Arc::clone(&upstream), Arc::clone(&buffer));

        strategy.preload(19).await.unwrap();
        assert_eq!(strategy.preloaded(), 8);
        // Another producer advanced the buffer past the first preloaded entries.
        for block in build_chain(0, 2, "A", "", 10) {
            buffer.enqueue(block).unwrap();
        }

        assert!(strategy.load(19).await.unwrap());
        assert_eq!(buffer.last_height(), 7);
        assert_eq!(strategy.preloaded(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_group_clears_queue() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 19, "A", "", 10)));
        let buffer = buffer(10_000);
        let strategy = strategy(Arc::clone(&upstream), Arc::clone(&buffer));

        strategy.preload(19).await.unwrap();
        upstream.fail_next(6);
        assert!(strategy.load(19).await.is_err());
        assert_eq!(strategy.preloaded(), 0);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_block_clears_queue() {
        let mut chain = build_chain(0, 19, "A", "", 10);
        chain[4].transactions.clear();
        let upstream = Arc::new(InMemoryUpstream::with_chain(chain));
        let buffer = buffer(10_000);
        let strategy = strategy(Arc::clone(&upstream), Arc::clone(&buffer));

        assert!(strategy.load(19).await.unwrap());
        assert_eq!(buffer.last_height(), 3);
        assert_eq!(buffer.current_bytes(), 40);
        assert_eq!(strategy.preloaded(), 0);
    }

    #[tokio::test]
    async fn test_stop_clears_queue() {
        let upstream = Arc::new(InMemoryUpstream::with_chain(build_chain(0, 19, "A", "", 10)));
        let strategy = strategy(upstream, buffer(10_000));
        strategy.preload(19).await.unwrap();
        assert!(strategy.preloaded() > 0);
        strategy.stop().await.unwrap();
        assert_eq!(strategy.preloaded(), 0);
    }
}
