//! Dispatcher configuration, statistics and outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::error::ErrorClass;
use crate::retry::RetryPolicy;
use crate::store::StoreError;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name for logging
    pub name: String,
    /// Maximum rows claimed per cycle
    pub batch_size: usize,
    /// Delay between cycles when there is no backlog
    pub poll_interval: Duration,
    /// How long to wait for one broker acknowledgement
    pub publish_timeout: Duration,
    /// Backoff for failed publishes and the attempt threshold for `failed`
    pub retry: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "outbox-dispatcher".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// What one committed cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    /// Acknowledged by the broker and marked `processed`.
    pub published: usize,
    /// Publish failed; row left `pending` with a retry delay.
    pub retried: usize,
    /// Routed to `failed` (malformed payload or attempts exhausted).
    pub failed: usize,
    /// The part of `failed` that the broker rejected on the last allowed attempt.
    pub exhausted: usize,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Claim, status update or commit failed; the batch was rolled back.
    #[error("storage failure during {operation}: {source}")]
    Store {
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// Shutdown observed mid-cycle; the batch was rolled back.
    #[error("dispatch cycle cancelled")]
    Cancelled,
}

impl DispatchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DispatchError::Store { .. } => ErrorClass::TransientInfra,
            DispatchError::Cancelled => ErrorClass::Cancellation,
        }
    }
}

pub(crate) fn store_error(operation: &'static str) -> impl FnOnce(StoreError) -> DispatchError {
    move |source| DispatchError::Store { operation, source }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub cycles_committed: u64,
    pub cycles_failed: u64,
    pub cycles_cancelled: u64,
    pub rows_claimed: u64,
    pub rows_published: u64,
    /// Broker errors and timeouts, whether the row was retried or dead-lettered.
    pub publish_failures: u64,
    /// Rows routed to `failed`, for any reason.
    pub rows_failed: u64,
    /// Rows routed to `failed` because their publish attempts ran out.
    pub rows_dead_lettered: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl DispatcherStats {
    pub(crate) fn record(&mut self, result: &Result<CycleReport, DispatchError>) {
        self.last_cycle_at = Some(Utc::now());
        match result {
            Ok(report) => {
                self.cycles_committed += 1;
                self.rows_claimed += report.claimed as u64;
                self.rows_published += report.published as u64;
                self.publish_failures += (report.retried + report.exhausted) as u64;
                self.rows_failed += report.failed as u64;
                self.rows_dead_lettered += report.exhausted as u64;
            }
            Err(DispatchError::Cancelled) => self.cycles_cancelled += 1,
            Err(err) => {
                self.cycles_failed += 1;
                self.last_error = Some(err.to_string());
            }
        }
    }
}
