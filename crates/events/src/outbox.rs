//! Outbox row model and status state machine.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::Event;

/// Engine-assigned, monotonic outbox row identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(i64);

impl OutboxId {
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Delivery status of an outbox row.
///
/// ```text
/// pending --(publish ok + commit)--> processed   (terminal)
/// pending --(publish failed)-------> pending     (retry later)
/// pending --(unrecoverable)--------> failed      (terminal, manual requeue only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }

    /// Whether the dispatcher may move a row from `self` to `next`.
    pub fn can_transition_to(&self, next: OutboxStatus) -> bool {
        matches!(
            (self, next),
            (OutboxStatus::Pending, OutboxStatus::Pending)
                | (OutboxStatus::Pending, OutboxStatus::Processed)
                | (OutboxStatus::Pending, OutboxStatus::Failed)
        )
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown outbox status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OutboxStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "processed" => Ok(OutboxStatus::Processed),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A persisted outbox row.
///
/// `payload` is opaque to the dispatcher and never changes after insert.
/// Only `status`, `processed_at` and the retry bookkeeping (`attempts`,
/// `last_error`, `next_attempt_at`) are ever mutated, and only by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxId,
    pub event_type: String,
    pub payload: String,
    pub status: OutboxStatus,
    /// Failed publish attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set only when the row reaches `processed`.
    pub processed_at: Option<DateTime<Utc>>,
    /// Earliest time the row may be claimed again after a failed publish.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Whether a dispatcher may claim this row at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// An outbox row about to be inserted; always starts out `pending`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboxEntry {
    pub event_type: String,
    pub payload: String,
}

impl NewOutboxEntry {
    /// Snapshot an event into its outbox form.
    pub fn for_event<E: Event>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            payload: serde_json::to_string(event)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(status: OutboxStatus, next_attempt_at: Option<DateTime<Utc>>) -> OutboxEntry {
        OutboxEntry {
            id: OutboxId::new(1),
            event_type: "product_created".to_string(),
            payload: "{}".to_string(),
            status,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
            next_attempt_at,
        }
    }

    #[test]
    fn status_is_forward_only() {
        assert!(OutboxStatus::Pending.can_transition_to(OutboxStatus::Processed));
        assert!(OutboxStatus::Pending.can_transition_to(OutboxStatus::Failed));
        assert!(OutboxStatus::Pending.can_transition_to(OutboxStatus::Pending));
        assert!(!OutboxStatus::Processed.can_transition_to(OutboxStatus::Pending));
        assert!(!OutboxStatus::Processed.can_transition_to(OutboxStatus::Failed));
        assert!(!OutboxStatus::Failed.can_transition_to(OutboxStatus::Processed));
    }

    #[test]
    fn status_parses_its_column_text() {
        for status in [OutboxStatus::Pending, OutboxStatus::Processed, OutboxStatus::Failed] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("done".parse::<OutboxStatus>().is_err());
    }

    #[test]
    fn backoff_delays_claimability() {
        let now = Utc::now();
        assert!(entry(OutboxStatus::Pending, None).is_claimable(now));
        assert!(entry(OutboxStatus::Pending, Some(now - Duration::seconds(1))).is_claimable(now));
        assert!(!entry(OutboxStatus::Pending, Some(now + Duration::seconds(30))).is_claimable(now));
        assert!(!entry(OutboxStatus::Processed, None).is_claimable(now));
        assert!(!entry(OutboxStatus::Failed, None).is_claimable(now));
    }
}
