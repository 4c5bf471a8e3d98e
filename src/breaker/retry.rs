//! Exponential backoff for transient failures, layered on a breaker.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{BreakerError, CircuitBreaker};
use crate::error::Classify;

/// Configures retry behaviour for calls to external resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Also caps consecutive
    /// verification failures before a task is blocked.
    pub max_attempts: u32,
    /// Base delay for exponential backoff.
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay (cap for exponential backoff).
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before retry number `attempt` (zero-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Call `op` through `breaker`, retrying transient failures with backoff.
///
/// Every attempt passes through the breaker and counts toward it. Permanent
/// errors are returned at once, and an open breaker stops retrying
/// immediately.
pub async fn call_with_retry<T, E, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<T, BreakerError<E>>
where
    E: Classify + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match breaker.execute(&mut op).await {
            Ok(value) => return Ok(value),
            Err(BreakerError::Open(open)) => return Err(BreakerError::Open(open)),
            Err(BreakerError::Inner(err)) => {
                let category = err.classify();
                attempt += 1;

                if !category.is_retryable() {
                    warn!(
                        resource = %breaker.resource_id(),
                        attempt,
                        error = %err,
                        "Non-retryable error"
                    );
                    return Err(BreakerError::Inner(err));
                }
                if attempt >= max_attempts {
                    warn!(
                        resource = %breaker.resource_id(),
                        attempts = attempt,
                        error = %err,
                        "Retry attempts exhausted"
                    );
                    return Err(BreakerError::Inner(err));
                }

                let delay = policy.backoff(attempt - 1);
                info!(
                    resource = %breaker.resource_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    category = category.label(),
                    error = %err,
                    "Retryable error, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
