//! Outbox events: the row model, the event contract and the broker envelope.

pub mod envelope;
pub mod event;
pub mod outbox;

pub use envelope::{partition_key, OutboxMessage, PayloadError};
pub use event::Event;
pub use outbox::{NewOutboxEntry, OutboxEntry, OutboxId, OutboxStatus, UnknownStatus};
