//! `relaybox-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult, IdError};
pub use id::{IdGenerator, ProductId, SnowflakeGenerator};
