//! Retry policy with backoff, shared by connection bootstrap and outbox rows.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts in total (`None` = retry forever)
    pub max_attempts: Option<u32>,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff strategy
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0); rows seeded differently retry at different times
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(1),
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: Option<u32>, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: Option<u32>, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Calculate delay after a given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_for(attempt, 0)
    }

    /// Like [`delay_for_attempt`](Self::delay_for_attempt), with the jitter
    /// also derived from `seed` (e.g. an outbox row id).
    pub fn delay_for(&self, attempt: u32, seed: u64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number and seed.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let mixed = (seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) % 100;
            let pseudo_random = ((u64::from(attempt) * 17 + mixed) % 100) as f64 / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` failed attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt < max)
    }
}

/// Run `action` until it succeeds or the policy gives up, sleeping between
/// attempts. Returns the last error when attempts are exhausted.
pub async fn retry_async<T, E, F, Fut>(policy: &RetryPolicy, operation: &str, mut action: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: core::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match action().await {
            Ok(value) => return Ok(value),
            Err(err) if policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    remaining = ?policy.max_attempts.map(|max| max.saturating_sub(attempt)),
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let policy = RetryPolicy {
            max_attempts: Some(10),
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn jitter_spreads_rows_on_the_same_attempt() {
        let policy = RetryPolicy::exponential(None, Duration::from_secs(1), Duration::from_secs(60));
        let delays: std::collections::HashSet<Duration> =
            (1..=20u64).map(|row| policy.delay_for(3, row)).collect();
        assert!(delays.len() > 1, "all rows got {delays:?}");

        assert_eq!(policy.delay_for(3, 7), policy.delay_for(3, 7));
        assert_eq!(policy.delay_for_attempt(3), policy.delay_for(3, 0));
    }

    #[test]
    fn unbounded_policy_always_retries() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(u32::MAX - 1));
    }

    #[test]
    fn bounded_policy_counts_total_attempts() {
        let policy = RetryPolicy::fixed(Some(3), Duration::ZERO);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[tokio::test]
    async fn retry_async_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Some(5), Duration::ZERO);

        let result: Result<u32, String> = retry_async(&policy, "flaky", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) } }
        })
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_async_returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::fixed(Some(2), Duration::ZERO);

        let result: Result<(), String> = retry_async(&policy, "down", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(format!("attempt {n}")) }
        })
        .await;

        assert_eq!(result, Err("attempt 2".to_string()));
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_cap_plus_jitter(attempt in 1u32..10_000, jitter in 0.0f64..1.0, seed in any::<u64>()) {
            let policy = RetryPolicy {
                max_attempts: None,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(30),
                strategy: BackoffStrategy::Exponential,
                jitter,
            };
            let cap_ms = 30_000.0 * (1.0 + jitter);
            prop_assert!(policy.delay_for_attempt(attempt).as_millis() as f64 <= cap_ms + 1.0);
            prop_assert!(policy.delay_for(attempt, seed).as_millis() as f64 <= cap_ms + 1.0);
        }
    }
}
