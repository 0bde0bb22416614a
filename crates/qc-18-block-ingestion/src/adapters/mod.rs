//! # Adapters Layer (Hexagonal Architecture)
//!
//! In-process implementations of the outbound ports, used by the
//! integration tests and for local runs without a node.

mod channel_consumer;
mod in_memory_upstream;

pub use channel_consumer::ChannelConsumer;
pub use in_memory_upstream::{build_chain, InMemoryUpstream};
