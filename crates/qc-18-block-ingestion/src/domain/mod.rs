//! # Domain Module
//!
//! Core domain types for Block Ingestion: the chain ledger, the block buffer,
//! the partial block collector and the messages they exchange.

pub mod buffer;
pub mod collector;
pub mod errors;
pub mod ledger;
pub mod value_objects;

pub use buffer::*;
pub use collector::*;
pub use errors::*;
pub use ledger::*;
pub use value_objects::*;
