//! Outbox dispatcher (relay from the outbox table to the broker).

pub mod executor;
pub mod types;

pub use executor::{DispatcherHandle, OutboxDispatcher};
pub use types::{CycleReport, DispatchError, DispatcherConfig, DispatcherStats};
