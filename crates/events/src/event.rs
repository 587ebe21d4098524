use serde::Serialize;

/// A business event that can be recorded in the outbox.
///
/// Events are facts: immutable once constructed, serialised once when the
/// outbox row is written and never re-derived afterwards.
pub trait Event: Serialize + core::fmt::Debug + Send + Sync {
    /// Stable event name stored in `outbox.event_type` (e.g. "product_created").
    fn event_type(&self) -> &'static str;
}
