//! # Fork Point Search
//!
//! Walks the local ledger backwards against the upstream chain until both
//! agree on a block. Everything above that block is invalid locally.

use shared_types::LightBlock;

use crate::domain::{BlockDetail, IngestionError, Result};
use crate::ports::UpstreamSource;

/// Where the local and upstream chains diverge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkPoint {
    /// Highest height both chains agree on; -1 if they share nothing.
    pub fork_height: i64,
    /// Local blocks above the fork point, newest first.
    pub invalidated: Vec<LightBlock>,
}

impl ForkPoint {
    /// Number of invalidated blocks.
    pub fn depth(&self) -> usize {
        self.invalidated.len()
    }
}

/// Find the fork point between `local` (oldest first, linked) and `upstream`.
///
/// Local heights above the upstream tip are invalidated without a fetch.
/// Reaching height 0 without a match yields fork height -1.
///
/// # Errors
/// - `DivergenceBeyondWindow` if no match is found and the oldest local block
///   is above height 0.
/// - Upstream errors from the block fetch.
pub async fn find_fork_point<U>(local: &[LightBlock], upstream: &U) -> Result<ForkPoint>
where
    U: UpstreamSource + ?Sized,
{
    let mut invalidated = Vec::new();
    let Some(oldest) = local.first() else {
        return Ok(ForkPoint {
            fork_height: -1,
            invalidated,
        });
    };
    let upstream_height = upstream.get_current_height().await?;

    for block in local.iter().rev() {
        if block.height > upstream_height {
            invalidated.push(block.clone());
            continue;
        }
        let remote = upstream
            .get_one_block_by_height(block.height, BlockDetail::Light)
            .await?;
        if remote.hash == block.hash && remote.previous_hash == block.previous_hash {
            tracing::info!(
                fork_height = block.height,
                depth = invalidated.len(),
                "[qc-18] Fork point found"
            );
            return Ok(ForkPoint {
                fork_height: block.height as i64,
                invalidated,
            });
        }
        tracing::debug!(
            height = block.height,
            local = %block.hash,
            upstream = %remote.hash,
            "[qc-18] Local block diverges from upstream"
        );
        invalidated.push(block.clone());
    }

    if oldest.height == 0 {
        return Ok(ForkPoint {
            fork_height: -1,
            invalidated,
        });
    }
    Err(IngestionError::DivergenceBeyondWindow {
        window: local.len(),
        lowest_checked: oldest.height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{build_chain, InMemoryUpstream};

    fn light(blocks: &[shared_types::Block]) -> Vec<LightBlock> {
        blocks.iter().map(LightBlock::from).collect()
    }

    #[tokio::test]
    async fn test_single_block_divergence() {
        let local = build_chain(0, 4, "L", "", 10);
        let mut remote = local[..4].to_vec();
        remote.extend(build_chain(4, 4, "U", "L3", 10));
        let upstream = InMemoryUpstream::with_chain(remote);

        let fork = find_fork_point(&light(&local), &upstream).await.unwrap();
        assert_eq!(fork.fork_height, 3);
        assert_eq!(fork.depth(), 1);
        assert_eq!(fork.invalidated[0].hash, "L4");
    }

    #[tokio::test]
    async fn test_no_divergence_means_fork_at_tip() {
        let chain = build_chain(0, 9, "A", "", 1);
        let upstream = InMemoryUpstream::with_chain(chain.clone());
        let fork = find_fork_point(&light(&chain), &upstream).await.unwrap();
        assert_eq!(fork.fork_height, 9);
        assert!(fork.invalidated.is_empty());
    }

    #[tokio::test]
    async fn test_local_above_shorter_upstream_is_invalidated() {
        let local = build_chain(0, 7, "A", "", 1);
        let upstream = InMemoryUpstream::with_chain(local[..5].to_vec());
        let fork = find_fork_point(&light(&local), &upstream).await.unwrap();
        assert_eq!(fork.fork_height, 4);
        let heights: Vec<u64> = fork.invalidated.iter().map(|b| b.height).collect();
        assert_eq!(heights, vec![7, 6, 5]);
    }

    #[tokio::test]
    async fn test_divergence_down_to_genesis() {
        let local = build_chain(0, 3, "L", "", 1);
        let upstream = InMemoryUpstream::with_chain(build_chain(0, 3, "U", "", 1));
        let fork = find_fork_point(&light(&local), &upstream).await.unwrap();
        assert_eq!(fork.fork_height, -1);
        assert_eq!(fork.depth(), 4);
    }

    #[tokio::test]
    async fn test_divergence_beyond_window() {
        let local = build_chain(10, 14, "L", "X9", 1);
        let mut remote = build_chain(0, 9, "U", "", 1);
        remote.extend(build_chain(10, 14, "U", "U9", 1));
        let upstream = InMemoryUpstream::with_chain(remote);

        let err = find_fork_point(&light(&local), &upstream).await.unwrap_err();
        assert!(matches!(
            err,
            IngestionError::DivergenceBeyondWindow { window: 5, lowest_checked: 10 }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_empty_ledger() {
        let upstream = InMemoryUpstream::new();
        let fork = find_fork_point(&[], &upstream).await.unwrap();
        assert_eq!(fork.fork_height, -1);
    }
}
