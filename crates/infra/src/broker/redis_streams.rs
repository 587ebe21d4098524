//! Redis Streams producer.
//!
//! Each message is appended with `XADD <topic> * key <partition key> payload
//! <body>`. Streams keep insertion order, so per-key order follows publish
//! order. Publishes run on tracked tasks over one multiplexed connection;
//! `close` waits for all of them before returning.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::IntoConnectionInfo;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{resolved, Broker, BrokerError, Completion, MessageId, PublishRequest};
use crate::config::BrokerConfig;

pub struct RedisStreamsBroker {
    conn: MultiplexedConnection,
    topic: String,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl RedisStreamsBroker {
    /// Connect a producer. A configured token is used as the connection
    /// password.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let mut info = config
            .url
            .as_str()
            .into_connection_info()
            .map_err(|e| BrokerError::Unavailable(format!("invalid broker url: {e}")))?;
        if let Some(token) = &config.token {
            info.redis.password = Some(token.clone());
        }

        let client = redis::Client::open(info).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)?;

        info!(topic = %config.topic, "redis streams producer connected");
        Ok(Self {
            conn,
            topic: config.topic.clone(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        })
    }
}

fn map_redis_error(err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() || err.is_connection_refusal() {
        BrokerError::Unavailable(err.to_string())
    } else {
        BrokerError::Rejected(err.to_string())
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn send_async(&self, request: PublishRequest) -> Completion {
        if self.closed.load(Ordering::Acquire) {
            return resolved(Err(BrokerError::Closed));
        }

        let (tx, rx) = oneshot::channel();
        let mut conn = self.conn.clone();
        let topic = self.topic.clone();
        self.tracker.spawn(async move {
            let result = redis::cmd("XADD")
                .arg(&topic)
                .arg("*")
                .arg("key")
                .arg(&request.key)
                .arg("payload")
                .arg(&request.payload[..])
                .query_async::<_, String>(&mut conn)
                .await
                .map(MessageId)
                .map_err(|e| {
                    warn!(topic = %topic, key = %request.key, error = %e, "XADD failed");
                    map_redis_error(e)
                });
            // The receiver may have given up (timeout or shutdown).
            let _ = tx.send(result);
        });
        rx
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.tracker.close();
        self.tracker.wait().await;
        debug!(topic = %self.topic, "redis streams producer closed");
    }
}
