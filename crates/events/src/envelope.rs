//! Wire form of an outbox row as handed to the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::outbox::{OutboxEntry, OutboxId};

/// A payload that can never be published.
///
/// Retrying cannot fix these, so the dispatcher routes the row to `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("message encoding failed: {0}")]
    Encode(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BusinessId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct KeySource {
    id: BusinessId,
}

/// Partition key for an outbox row: `"{event_type}:{business_id}"`.
///
/// Only the `id` field of the payload is read; events for the same business
/// entity share a key so a key-ordered broker keeps them in order.
pub fn partition_key(entry: &OutboxEntry) -> Result<String, PayloadError> {
    let source: KeySource = serde_json::from_str(&entry.payload)
        .map_err(|e| PayloadError::Malformed(format!("outbox row {}: {e}", entry.id)))?;

    let id = match source.id {
        BusinessId::Number(n) => n.to_string(),
        BusinessId::Text(s) if !s.trim().is_empty() => s,
        BusinessId::Text(_) => {
            return Err(PayloadError::Malformed(format!(
                "outbox row {}: empty business id",
                entry.id
            )));
        }
    };

    Ok(format!("{}:{}", entry.event_type, id))
}

/// Message body published for one outbox row.
///
/// `payload` is the stored text forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxId,
    pub event_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    pub fn from_entry(entry: &OutboxEntry) -> Self {
        Self {
            id: entry.id,
            event_type: entry.event_type.clone(),
            payload: entry.payload.clone(),
            created_at: entry.created_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        serde_json::to_vec(self).map_err(|e| PayloadError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        serde_json::from_slice(bytes).map_err(|e| PayloadError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxStatus;

    fn entry(payload: &str) -> OutboxEntry {
        OutboxEntry {
            id: OutboxId::new(9),
            event_type: "product_created".to_string(),
            payload: payload.to_string(),
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
            next_attempt_at: None,
        }
    }

    #[test]
    fn key_combines_event_type_and_business_id() {
        let key = partition_key(&entry(r#"{"id": 1234, "name": "lamp"}"#)).unwrap();
        assert_eq!(key, "product_created:1234");

        let key = partition_key(&entry(r#"{"id": "sku-1"}"#)).unwrap();
        assert_eq!(key, "product_created:sku-1");
    }

    #[test]
    fn undecodable_payloads_are_malformed() {
        for payload in ["not json", "{}", r#"{"id": null}"#, r#"{"id": "  "}"#, "[]", "42"] {
            assert!(
                matches!(partition_key(&entry(payload)), Err(PayloadError::Malformed(_))),
                "payload {payload:?} should be malformed"
            );
        }
    }

    #[test]
    fn message_forwards_payload_text_verbatim() {
        let raw = r#"{"id":5,  "name":"spaced"}"#;
        let e = entry(raw);
        let bytes = OutboxMessage::from_entry(&e).encode().unwrap();
        let decoded = OutboxMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.payload, raw);
        assert_eq!(decoded.id, e.id);
    }
}
