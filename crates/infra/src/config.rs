//! Process configuration, read once from the environment at startup.

use core::fmt;
use core::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::DispatcherConfig;
use crate::retry::RetryPolicy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone)]
pub struct DatabaseConfig {
    /// Required when persistent stores are enabled.
    pub url: Option<String>,
    pub max_connections: u32,
    /// Policy for the initial connect and ping.
    pub connect_retry: RetryPolicy,
}

// Connection strings carry credentials; keep them out of logs.
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .field("connect_retry", &self.connect_retry)
            .finish()
    }
}

#[derive(Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub token: Option<String>,
    pub topic: String,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("url", &redact_userinfo(&self.url))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("topic", &self.topic)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Postgres + Redis when true, in-memory store and broker otherwise.
    pub persistent: bool,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub dispatcher: DispatcherConfig,
    pub machine_id: u16,
    pub shutdown_grace: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let persistent = parse_bool(&get, "USE_PERSISTENT_STORES", false)?;
        let database_url = get("DATABASE_URL");
        if persistent && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        let connect_attempts: u32 = parse_or(&get, "DB_CONNECT_ATTEMPTS", 30)?;
        let connect_backoff = millis_or(&get, "DB_CONNECT_BACKOFF_MS", 500)?;
        let database = DatabaseConfig {
            url: database_url,
            max_connections: positive(&get, "DB_MAX_CONNECTIONS", 20)?,
            connect_retry: RetryPolicy::fixed(Some(connect_attempts.max(1)), connect_backoff),
        };

        let broker = BrokerConfig {
            url: get("BROKER_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            token: get("BROKER_TOKEN"),
            topic: get("BROKER_TOPIC").unwrap_or_else(|| "products".to_string()),
        };

        let max_attempts = match get("OUTBOX_MAX_ATTEMPTS") {
            None => None,
            Some(raw) => Some(parse_value::<u32>("OUTBOX_MAX_ATTEMPTS", &raw).and_then(|n| {
                if n == 0 {
                    Err(invalid("OUTBOX_MAX_ATTEMPTS", &raw, "must be at least 1"))
                } else {
                    Ok(n)
                }
            })?),
        };
        let retry_base = millis_or(&get, "OUTBOX_RETRY_BASE_MS", 1_000)?;
        let retry_max = millis_or(&get, "OUTBOX_RETRY_MAX_MS", 60_000)?;

        let poll_interval = millis_or(&get, "OUTBOX_POLL_INTERVAL_MS", 5_000)?;
        if poll_interval.is_zero() {
            return Err(invalid("OUTBOX_POLL_INTERVAL_MS", "0", "must be positive"));
        }
        let publish_timeout = millis_or(&get, "OUTBOX_PUBLISH_TIMEOUT_MS", 10_000)?;
        if publish_timeout.is_zero() {
            return Err(invalid("OUTBOX_PUBLISH_TIMEOUT_MS", "0", "must be positive"));
        }

        let dispatcher = DispatcherConfig::default()
            .with_batch_size(positive(&get, "OUTBOX_BATCH_SIZE", 100)? as usize)
            .with_poll_interval(poll_interval)
            .with_publish_timeout(publish_timeout)
            .with_retry_policy(RetryPolicy::exponential(max_attempts, retry_base, retry_max.max(retry_base)));

        Ok(Self {
            port: parse_or(&get, "PORT", 3000)?,
            persistent,
            database,
            broker,
            dispatcher,
            machine_id: parse_or(&get, "MACHINE_ID", 1)?,
            shutdown_grace: millis_or(&get, "SHUTDOWN_GRACE_MS", 5_000)?,
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse::<T>().map_err(|e| invalid(key, raw, e.to_string()))
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn positive<G>(get: &G, key: &'static str, default: u32) -> Result<u32, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let value = parse_or(get, key, default)?;
    if value == 0 {
        return Err(invalid(key, "0", "must be positive"));
    }
    Ok(value)
}

fn millis_or<G>(get: &G, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default_ms).map(Duration::from_millis)
}

fn parse_bool<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(key, &raw, "expected a boolean")),
        },
    }
}

/// Hide the `user:password@` part of a connection URL.
fn redact_userinfo(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{scheme}://<redacted>@{}", &rest[at + 1..]),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.port, 3000);
        assert!(!config.persistent);
        assert_eq!(config.database.max_connections, 20);
        assert_eq!(config.database.connect_retry.max_attempts, Some(30));
        assert_eq!(config.broker.topic, "products");
        assert_eq!(config.dispatcher.batch_size, 100);
        assert_eq!(config.dispatcher.poll_interval, Duration::from_secs(5));
        assert_eq!(config.dispatcher.publish_timeout, Duration::from_secs(10));
        assert_eq!(config.dispatcher.retry.max_attempts, None);
        assert_eq!(config.machine_id, 1);
    }

    #[test]
    fn persistent_mode_requires_database_url() {
        let err = config(&[("USE_PERSISTENT_STORES", "true")]).unwrap_err();
        assert_eq!(err, ConfigError::Missing("DATABASE_URL"));

        let ok = config(&[("USE_PERSISTENT_STORES", "true"), ("DATABASE_URL", "postgres://localhost/relay")]);
        assert!(ok.unwrap().persistent);
    }

    #[test]
    fn invalid_numbers_name_the_key() {
        let err = config(&[("OUTBOX_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_BATCH_SIZE", .. }));

        let err = config(&[("OUTBOX_BATCH_SIZE", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_BATCH_SIZE", .. }));

        let err = config(&[("OUTBOX_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "OUTBOX_MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn retry_settings_flow_into_dispatcher_policy() {
        let config = config(&[
            ("OUTBOX_MAX_ATTEMPTS", "5"),
            ("OUTBOX_RETRY_BASE_MS", "200"),
            ("OUTBOX_RETRY_MAX_MS", "1000"),
        ])
        .unwrap();
        let retry = &config.dispatcher.retry;
        assert_eq!(retry.max_attempts, Some(5));
        assert_eq!(retry.base_delay, Duration::from_millis(200));
        assert_eq!(retry.max_delay, Duration::from_millis(1000));
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let config = config(&[("DATABASE_URL", "postgres://u:hunter2@db/relay"), ("BROKER_TOKEN", "s3cret")]).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn broker_url_credentials_are_redacted() {
        let config = config(&[("BROKER_URL", "redis://:pw-in-url@cache:6379/0")]).unwrap();
        let rendered = format!("{:?}", config.broker);
        assert!(!rendered.contains("pw-in-url"));
        assert!(rendered.contains("cache:6379/0"));

        assert_eq!(redact_userinfo("redis://cache:6379"), "redis://cache:6379");
        assert_eq!(redact_userinfo("redis://user:pw@cache:6379"), "redis://<redacted>@cache:6379");
    }
}
