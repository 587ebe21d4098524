//! Message broker producer contract.
//!
//! Publishing is asynchronous: `send_async` hands the message to the
//! producer and returns a single-use completion that resolves exactly once
//! with the broker's verdict. The caller decides how long to wait.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::error::ErrorClass;

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::{BrokerBehavior, InMemoryBroker, PublishedMessage};
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;

/// Broker-assigned id of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl core::fmt::Display for MessageId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One message to publish on the producer's topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    /// Partition key; messages sharing a key stay ordered.
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("no broker acknowledgement within {0:?}")]
    Timeout(Duration),

    #[error("producer closed")]
    Closed,
}

impl BrokerError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::TransientInfra
    }
}

/// Completion of one publish.
pub type Completion = oneshot::Receiver<Result<MessageId, BrokerError>>;

#[async_trait]
pub trait Broker: Send + Sync {
    fn topic(&self) -> &str;

    /// Submit a message without waiting for the broker.
    ///
    /// Must not block. A producer that cannot accept the message resolves
    /// the completion with an error instead.
    fn send_async(&self, request: PublishRequest) -> Completion;

    /// Stop accepting messages and wait for in-flight publishes to resolve.
    async fn close(&self);
}

#[async_trait]
impl<T> Broker for std::sync::Arc<T>
where
    T: Broker + ?Sized,
{
    fn topic(&self) -> &str {
        (**self).topic()
    }

    fn send_async(&self, request: PublishRequest) -> Completion {
        (**self).send_async(request)
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// A completion that is already resolved.
pub(crate) fn resolved(result: Result<MessageId, BrokerError>) -> Completion {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}
