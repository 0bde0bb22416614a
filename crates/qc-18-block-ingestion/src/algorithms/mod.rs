//! # Algorithms Module
//!
//! Pure or port-driven algorithms used by the application layer.

pub mod batching;
pub mod fork_search;
pub mod retry;

pub use batching::{group_preloaded, split_reorg, DEFAULT_REORG_SPLIT_THRESHOLD};
pub use fork_search::{find_fork_point, ForkPoint};
pub use retry::{retry_with_policy, RetryPolicy, DEFAULT_ATTEMPTS};
