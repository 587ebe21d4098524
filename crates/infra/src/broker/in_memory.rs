//! In-memory broker for tests/dev.
//!
//! Records every publish attempt and every delivered message. Behavior can be
//! switched at runtime to simulate an outage (`Failing`), a broker that never
//! answers (`Stalled`), or slow acknowledgements (`latency`).

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::{resolved, Broker, BrokerError, Completion, MessageId, PublishRequest};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BrokerBehavior {
    #[default]
    Healthy,
    /// Every publish is rejected with this reason.
    Failing(String),
    /// Publishes are accepted but never acknowledged until `close`.
    Stalled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub id: MessageId,
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BrokerState {
    behavior: BrokerBehavior,
    failing_keys: HashSet<String>,
    attempts: Vec<PublishRequest>,
    delivered: Vec<PublishedMessage>,
    stalled: Vec<oneshot::Sender<Result<MessageId, BrokerError>>>,
    next_offset: u64,
    closed: bool,
}

#[derive(Debug)]
pub struct InMemoryBroker {
    topic: String,
    latency: Option<Duration>,
    state: Mutex<BrokerState>,
    tracker: TaskTracker,
}

impl InMemoryBroker {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            latency: None,
            state: Mutex::new(BrokerState::default()),
            tracker: TaskTracker::new(),
        }
    }

    /// Acknowledge each publish only after `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior(&self, behavior: BrokerBehavior) {
        self.state().behavior = behavior;
    }

    /// Reject publishes for one partition key only.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.state().failing_keys.insert(key.into());
    }

    /// Every request handed to `send_async`, in call order.
    pub fn attempts(&self) -> Vec<PublishRequest> {
        self.state().attempts.clone()
    }

    /// Messages the broker accepted, in acceptance order.
    pub fn delivered(&self) -> Vec<PublishedMessage> {
        self.state().delivered.clone()
    }

    pub fn delivered_keys(&self) -> Vec<String> {
        self.state().delivered.iter().map(|m| m.key.clone()).collect()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn send_async(&self, request: PublishRequest) -> Completion {
        let mut state = self.state();
        if state.closed {
            return resolved(Err(BrokerError::Closed));
        }
        state.attempts.push(request.clone());

        let behavior = state.behavior.clone();
        let outcome = match behavior {
            BrokerBehavior::Stalled => {
                let (tx, rx) = oneshot::channel();
                state.stalled.push(tx);
                return rx;
            }
            BrokerBehavior::Failing(reason) => Err(BrokerError::Rejected(reason)),
            BrokerBehavior::Healthy if state.failing_keys.contains(&request.key) => {
                Err(BrokerError::Rejected(format!("key {} refused", request.key)))
            }
            BrokerBehavior::Healthy => {
                state.next_offset += 1;
                let id = MessageId(format!("{}-{}", self.topic, state.next_offset));
                state.delivered.push(PublishedMessage {
                    id: id.clone(),
                    key: request.key,
                    payload: request.payload,
                });
                Ok(id)
            }
        };
        drop(state);

        match self.latency {
            None => resolved(outcome),
            Some(latency) => {
                let (tx, rx) = oneshot::channel();
                self.tracker.spawn(async move {
                    tokio::time::sleep(latency).await;
                    let _ = tx.send(outcome);
                });
                rx
            }
        }
    }

    async fn close(&self) {
        let stalled = {
            let mut state = self.state();
            state.closed = true;
            std::mem::take(&mut state.stalled)
        };
        for tx in stalled {
            let _ = tx.send(Err(BrokerError::Closed));
        }

        self.tracker.close();
        self.tracker.wait().await;
        debug!(topic = %self.topic, "in-memory broker closed");
    }
}
