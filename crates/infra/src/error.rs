//! Error classes shared by the write path and the dispatcher.

use serde::Serialize;

use relaybox_events::PayloadError;

/// Coarse classification that decides how a failure is handled.
///
/// - `Validation`: caller's fault, never retried, surfaced immediately.
/// - `TransientInfra`: storage or broker temporarily unavailable; retried
///   (connection layer at startup, next dispatch cycle for outbox rows).
/// - `PermanentPayload`: the row can never be published; routed to `failed`.
/// - `Cancellation`: shutdown observed mid-operation; nothing was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    TransientInfra,
    PermanentPayload,
    Cancellation,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorClass::TransientInfra)
    }
}

impl From<&PayloadError> for ErrorClass {
    fn from(_: &PayloadError) -> Self {
        ErrorClass::PermanentPayload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerError;

    #[test]
    fn only_transient_failures_are_retried() {
        assert!(ErrorClass::TransientInfra.is_retryable());
        assert!(!ErrorClass::PermanentPayload.is_retryable());
        assert!(!ErrorClass::Validation.is_retryable());
        assert!(!ErrorClass::Cancellation.is_retryable());
    }

    #[test]
    fn undecodable_payloads_are_permanent_and_broker_errors_transient() {
        let payload = PayloadError::Malformed("no id".to_string());
        assert_eq!(ErrorClass::from(&payload), ErrorClass::PermanentPayload);
        assert_eq!(BrokerError::Closed.class(), ErrorClass::TransientInfra);
    }
}
