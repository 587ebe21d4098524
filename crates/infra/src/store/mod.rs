//! Transactional storage contracts for the dual-write path and the dispatcher.
//!
//! Two transaction shapes exist:
//!
//! - [`WriteTransaction`]: inserts one business row and its outbox row, then
//!   commits both or neither.
//! - [`ClaimedBatch`]: a set of pending outbox rows locked by one dispatcher
//!   (rows locked by another open claim are skipped, never waited on). Status
//!   updates stay inside the claim and become visible only on `commit`;
//!   dropping or rolling back the batch releases the locks and leaves every
//!   row exactly as it was.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use relaybox_core::ProductId;
use relaybox_events::{NewOutboxEntry, OutboxEntry, OutboxId, OutboxStatus};
use relaybox_products::{CreateProduct, Product};

use crate::error::ErrorClass;

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryOutboxStore, StoreFault};
pub use postgres::PostgresOutboxStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection lost, pool closed, timeout, commit failure.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Unique constraint hit (e.g. duplicate business id).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A value was rejected by the schema or could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("outbox row {0} not found")]
    NotFound(OutboxId),

    /// The row is not part of the claim it was updated through.
    #[error("outbox row {0} is not held by this claim")]
    NotClaimed(OutboxId),

    #[error("outbox row {id} cannot move from {from} to {to}")]
    IllegalTransition {
        id: OutboxId,
        from: OutboxStatus,
        to: OutboxStatus,
    },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound(_) | StoreError::IllegalTransition { .. } => ErrorClass::Validation,
            _ => ErrorClass::TransientInfra,
        }
    }
}

/// Number of outbox rows per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxCounts {
    pub pending: u64,
    pub processed: u64,
    pub failed: u64,
}

impl OutboxCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processed + self.failed
    }

    pub(crate) fn add(&mut self, status: OutboxStatus, n: u64) {
        match status {
            OutboxStatus::Pending => self.pending += n,
            OutboxStatus::Processed => self.processed += n,
            OutboxStatus::Failed => self.failed += n,
        }
    }
}

/// Storage side of the dual-write path.
#[async_trait]
pub trait WriteStore: Send + Sync {
    async fn begin_write(&self) -> Result<Box<dyn WriteTransaction>, StoreError>;
}

/// One open write transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait WriteTransaction: Send {
    async fn insert_product(&mut self, id: ProductId, request: &CreateProduct) -> Result<Product, StoreError>;

    /// Insert a `pending` outbox row; the store assigns id and `created_at`.
    async fn insert_outbox(&mut self, entry: &NewOutboxEntry) -> Result<OutboxId, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Storage side of the dispatcher.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Open a transaction and lock up to `limit` claimable rows, oldest
    /// `created_at` first (ties by id).
    ///
    /// Claimable means `pending` with no retry delay still in the future.
    async fn claim_pending(&self, limit: usize) -> Result<Box<dyn ClaimedBatch>, StoreError>;
}

/// Rows locked by one dispatch cycle.
///
/// Every update is checked against the forward-only status machine and
/// applies only to rows of this batch.
#[async_trait]
pub trait ClaimedBatch: Send {
    fn entries(&self) -> &[OutboxEntry];

    async fn mark_processed(&mut self, id: OutboxId, processed_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Keep the row `pending` but record the failure and hold it back until
    /// `retry_at`.
    async fn record_failure(
        &mut self,
        id: OutboxId,
        attempts: u32,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn mark_failed(&mut self, id: OutboxId, attempts: u32, reason: &str) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// Operator view of the outbox.
#[async_trait]
pub trait OutboxAdmin: Send + Sync {
    async fn counts(&self) -> Result<OutboxCounts, StoreError>;

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxEntry>, StoreError>;

    /// Move a `failed` row back to `pending` with its retry bookkeeping reset.
    async fn requeue_failed(&self, id: OutboxId) -> Result<OutboxEntry, StoreError>;
}

#[async_trait]
impl<T> WriteStore for std::sync::Arc<T>
where
    T: WriteStore + ?Sized,
{
    async fn begin_write(&self) -> Result<Box<dyn WriteTransaction>, StoreError> {
        (**self).begin_write().await
    }
}

#[async_trait]
impl<T> ClaimStore for std::sync::Arc<T>
where
    T: ClaimStore + ?Sized,
{
    async fn claim_pending(&self, limit: usize) -> Result<Box<dyn ClaimedBatch>, StoreError> {
        (**self).claim_pending(limit).await
    }
}

#[async_trait]
impl<T> OutboxAdmin for std::sync::Arc<T>
where
    T: OutboxAdmin + ?Sized,
{
    async fn counts(&self) -> Result<OutboxCounts, StoreError> {
        (**self).counts().await
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxEntry>, StoreError> {
        (**self).get(id).await
    }

    async fn requeue_failed(&self, id: OutboxId) -> Result<OutboxEntry, StoreError> {
        (**self).requeue_failed(id).await
    }
}
