//! # Batching
//!
//! Grouping of preloaded block metadata into byte-bounded fetch requests and
//! slicing of large rollbacks into bounded reorganisation steps.

use shared_types::LightBlock;
use std::collections::VecDeque;

use crate::domain::{PreloadedBlockInfo, ReorgSignal};

/// Default number of invalidated blocks carried by one reorg step.
pub const DEFAULT_REORG_SPLIT_THRESHOLD: usize = 100;

/// Pop preloaded entries into at most `groups` fetch groups.
///
/// Entries are taken from the front of `queue` (ascending height). Each group
/// is filled greedily up to `max_bytes_per_request` but always receives at
/// least one entry, so a block larger than the limit is still fetched alone.
/// Entries at or below `last_height` are stale and dropped.
pub fn group_preloaded(
    queue: &mut VecDeque<PreloadedBlockInfo>,
    groups: usize,
    max_bytes_per_request: u64,
    last_height: i64,
) -> Vec<Vec<PreloadedBlockInfo>> {
    let mut result = Vec::with_capacity(groups);
    while result.len() < groups {
        let mut group: Vec<PreloadedBlockInfo> = Vec::new();
        let mut bytes = 0u64;
        while let Some(next) = queue.front() {
            if next.height as i64 <= last_height {
                queue.pop_front();
                continue;
            }
            if !group.is_empty() && bytes + next.size_bytes > max_bytes_per_request {
                break;
            }
            bytes += next.size_bytes;
            if let Some(info) = queue.pop_front() {
                group.push(info);
            }
        }
        if group.is_empty() {
            break;
        }
        result.push(group);
    }
    result
}

/// Split a rollback into reorganisation steps.
///
/// `invalidated` is newest first. While more than `threshold` blocks remain,
/// the newest `threshold` are emitted as an `InProgress` step truncating just
/// below them. The rest go into a single terminal `Completed` step.
pub fn split_reorg(
    mut invalidated: Vec<LightBlock>,
    fork_height: i64,
    threshold: usize,
) -> Vec<ReorgSignal> {
    let threshold = threshold.max(1);
    let mut signals = Vec::with_capacity(invalidated.len() / threshold + 1);
    while invalidated.len() > threshold {
        let rest = invalidated.split_off(threshold);
        let slice = std::mem::replace(&mut invalidated, rest);
        let truncate_to = slice
            .last()
            .map(|b| b.height as i64 - 1)
            .unwrap_or(fork_height);
        signals.push(ReorgSignal::InProgress {
            truncate_to,
            invalidated: slice,
        });
    }
    signals.push(ReorgSignal::Completed {
        fork_height,
        invalidated,
    });
    signals
}
