//! `relaybox-infra`: the transactional outbox engine.
//!
//! - [`write_path`]: business row + outbox row in one transaction
//! - [`store`]: transactional storage (Postgres, in-memory)
//! - [`broker`]: asynchronous producers (Redis Streams, in-memory)
//! - [`dispatcher`]: claim, publish and finalize outbox rows
//! - [`config`], [`db`], [`retry`]: process bootstrap

pub mod broker;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod retry;
pub mod store;
pub mod write_path;

pub use error::ErrorClass;
