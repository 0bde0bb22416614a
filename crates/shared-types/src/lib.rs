//! # Shared Types Crate
//!
//! Chain entities shared across subsystems: full blocks and transactions as
//! delivered by an upstream node, and the `LightBlock` projection used for
//! sequencing checks.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All cross-subsystem chain types are defined here.
//! - **Size on construction**: `Block::new` computes the accounted size once;
//!   a block without transactions cannot be built.

pub mod entities;
pub mod errors;

pub use entities::*;
pub use errors::*;
