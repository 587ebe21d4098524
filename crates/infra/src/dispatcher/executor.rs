//! Outbox dispatcher: claim, publish, finalize, commit.
//!
//! ```text
//! claim_pending(batch_size)        (opens tx, FOR UPDATE SKIP LOCKED)
//!   ↓
//! for each row, oldest first:
//!   cancelled?            → rollback whole batch
//!   partition key / body  → malformed: mark failed
//!   send_async + wait     → ack: mark processed
//!                         → error/timeout: record failure (or mark failed
//!                           once attempts are exhausted)
//!                         → cancelled while waiting: rollback whole batch
//!   ↓
//! commit                           (one commit per cycle)
//! ```
//!
//! A row is only ever `processed` if the broker acknowledged it *and* the
//! commit succeeded. Any storage error or cancellation rolls back the whole
//! batch: rows already acknowledged stay `pending` and are published again
//! by a later cycle (at-least-once).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use relaybox_events::{partition_key, OutboxEntry, OutboxMessage, PayloadError};

use super::types::{store_error, CycleReport, DispatchError, DispatcherConfig, DispatcherStats};
use crate::broker::{Broker, BrokerError, MessageId, PublishRequest};
use crate::error::ErrorClass;
use crate::store::{ClaimStore, ClaimedBatch};

enum Delivery {
    Acknowledged(MessageId),
    Failed { class: ErrorClass, reason: String },
    Cancelled,
}

impl From<BrokerError> for Delivery {
    fn from(err: BrokerError) -> Self {
        Delivery::Failed {
            class: err.class(),
            reason: err.to_string(),
        }
    }
}

/// Relays committed outbox rows to the broker.
///
/// Any number of dispatchers may share one store; row locking keeps their
/// batches disjoint.
pub struct OutboxDispatcher<S, B> {
    store: S,
    broker: B,
    config: DispatcherConfig,
    instance: Uuid,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S, B> OutboxDispatcher<S, B>
where
    S: ClaimStore,
    B: Broker,
{
    pub fn new(store: S, broker: B, config: DispatcherConfig) -> Self {
        Self {
            store,
            broker,
            config,
            instance: Uuid::now_v7(),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Shared handle to the live statistics.
    pub fn stats_handle(&self) -> Arc<Mutex<DispatcherStats>> {
        Arc::clone(&self.stats)
    }

    /// Run one claim → publish → commit cycle.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fired before the batch was
    /// finalized; nothing from the batch was committed in that case.
    #[instrument(skip_all, fields(dispatcher = %self.config.name, instance = %self.instance))]
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, DispatchError> {
        let result = self.cycle(cancel).await;

        match &result {
            Ok(report) if report.claimed > 0 => info!(
                claimed = report.claimed,
                published = report.published,
                retried = report.retried,
                failed = report.failed,
                "outbox cycle committed"
            ),
            Ok(_) => debug!("no claimable outbox rows"),
            Err(DispatchError::Cancelled) => info!("outbox cycle cancelled, batch rolled back"),
            Err(err) => error!(error = %err, "outbox cycle failed, batch rolled back"),
        }

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&result);
        result
    }

    async fn cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let mut batch = self
            .store
            .claim_pending(self.config.batch_size)
            .await
            .map_err(store_error("claim"))?;

        match self.publish_batch(batch.as_mut(), cancel).await {
            Ok(report) => {
                batch.commit().await.map_err(store_error("commit"))?;
                Ok(report)
            }
            Err(err) => {
                if let Err(rollback_err) = batch.rollback().await {
                    warn!(error = %rollback_err, "rollback of claimed batch failed");
                }
                Err(err)
            }
        }
    }

    async fn publish_batch(
        &self,
        batch: &mut dyn ClaimedBatch,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, DispatchError> {
        let entries = batch.entries().to_vec();
        let mut report = CycleReport {
            claimed: entries.len(),
            ..CycleReport::default()
        };

        for entry in &entries {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }

            let delivery = match prepare(entry) {
                Ok(request) => self.publish(request, cancel).await,
                Err(err) => Delivery::Failed {
                    class: ErrorClass::from(&err),
                    reason: err.to_string(),
                },
            };

            match delivery {
                Delivery::Acknowledged(message_id) => {
                    batch
                        .mark_processed(entry.id, Utc::now())
                        .await
                        .map_err(store_error("mark_processed"))?;
                    debug!(outbox_id = %entry.id, %message_id, "outbox row published");
                    report.published += 1;
                }
                Delivery::Failed { class, reason } if !class.is_retryable() => {
                    warn!(outbox_id = %entry.id, error = %reason, "unpublishable outbox row marked failed");
                    batch
                        .mark_failed(entry.id, entry.attempts, &reason)
                        .await
                        .map_err(store_error("mark_failed"))?;
                    report.failed += 1;
                }
                Delivery::Failed { reason, .. } => {
                    let attempts = entry.attempts.saturating_add(1);
                    if self.config.retry.should_retry(attempts) {
                        let seed = entry.id.get().unsigned_abs();
                        let delay = self.config.retry.delay_for(attempts, seed);
                        let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                        warn!(
                            outbox_id = %entry.id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %reason,
                            "publish failed, row stays pending"
                        );
                        batch
                            .record_failure(entry.id, attempts, &reason, retry_at)
                            .await
                            .map_err(store_error("record_failure"))?;
                        report.retried += 1;
                    } else {
                        error!(outbox_id = %entry.id, attempts, error = %reason, "publish attempts exhausted, row marked failed");
                        let reason = format!("publish failed after {attempts} attempts: {reason}");
                        batch
                            .mark_failed(entry.id, attempts, &reason)
                            .await
                            .map_err(store_error("mark_failed"))?;
                        report.failed += 1;
                        report.exhausted += 1;
                    }
                }
                Delivery::Cancelled => return Err(DispatchError::Cancelled),
            }
        }

        Ok(report)
    }

    /// Submit one message and wait for its completion, the publish timeout or
    /// cancellation, whichever comes first. Cancellation wins ties.
    async fn publish(&self, request: PublishRequest, cancel: &CancellationToken) -> Delivery {
        let completion = self.broker.send_async(request);
        let timeout = self.config.publish_timeout;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Delivery::Cancelled,
            outcome = tokio::time::timeout(timeout, completion) => match outcome {
                Ok(Ok(Ok(message_id))) => Delivery::Acknowledged(message_id),
                Ok(Ok(Err(err))) => err.into(),
                // Producer dropped the completion without answering.
                Ok(Err(_)) => BrokerError::Closed.into(),
                Err(_) => BrokerError::Timeout(timeout).into(),
            },
        }
    }
}

fn prepare(entry: &OutboxEntry) -> Result<PublishRequest, PayloadError> {
    let key = partition_key(entry)?;
    let payload = OutboxMessage::from_entry(entry).encode()?;
    Ok(PublishRequest { key, payload })
}

impl<S, B> OutboxDispatcher<S, B>
where
    S: ClaimStore + 'static,
    B: Broker + 'static,
{
    /// Run cycles until `cancel` fires.
    ///
    /// Cycles start on a fixed interval; a cycle that filled its batch and
    /// published something is followed immediately by another one.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            dispatcher = %self.config.name,
            instance = %self.instance,
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox dispatcher started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            loop {
                match self.run_cycle(&cancel).await {
                    Ok(report) if report.claimed == self.config.batch_size && report.published > 0 => continue,
                    _ => break,
                }
            }
        }

        info!(dispatcher = %self.config.name, "outbox dispatcher stopped");
    }

    /// Start the dispatcher on a background task.
    ///
    /// The task stops when `cancel` (or the returned handle) is cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> DispatcherHandle {
        let cancel = cancel.child_token();
        let stats = self.stats_handle();
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });

        DispatcherHandle { cancel, join, stats }
    }
}

/// Handle to control a running dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stats_handle(&self) -> Arc<Mutex<DispatcherStats>> {
        Arc::clone(&self.stats)
    }

    /// Cancel the dispatcher and wait up to `grace` for it to stop.
    ///
    /// An in-flight cycle aborts and rolls back its batch. If the task has
    /// not stopped within `grace` it is aborted, which drops the open claim.
    /// Returns `true` when the task stopped on its own.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        self.cancel.cancel();

        match tokio::time::timeout(grace, &mut self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(error = %err, "outbox dispatcher task failed");
                false
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "outbox dispatcher did not stop in time, aborting");
                self.join.abort();
                let _ = self.join.await;
                false
            }
        }
    }
}
