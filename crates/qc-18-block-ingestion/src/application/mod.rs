//! # Application Module
//!
//! Long-running components and the service orchestrating them.

pub mod iterator;
pub mod loader;
pub mod reorg;
pub mod scheduler;
pub mod service;

pub use iterator::{AckGate, BlockIterator};
pub use loader::{
    build_strategy, ByBatches, ByWorkers, LoadStrategy, Loader, PreloadThenFetch, PushStream,
};
pub use reorg::{ReorgCoordinator, ReorgPlan};
pub use scheduler::{CycleOutcome, PollInterval, PollingTask};
pub use service::IngestionService;
