//! Timeout configuration.
//!
//! This module holds the time limits applied to worker invocations, whole
//! batches, collaborator commands, and the threshold after which an
//! in-flight task is considered stale.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for timeout behavior during orchestration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Maximum time allowed for a single worker invocation.
    /// Default: 600 seconds (10 minutes)
    #[serde(rename = "invocation_timeout_ms", with = "crate::config::duration_ms")]
    pub invocation_timeout: Duration,

    /// Maximum time allowed for one dispatched sub-batch.
    /// Invocations still running when it expires are cancelled.
    /// Default: 1800 seconds (30 minutes)
    #[serde(rename = "batch_timeout_ms", with = "crate::config::duration_ms")]
    pub batch_timeout: Duration,

    /// How long a task may keep its resources locked before the stale
    /// sweep blocks it.
    /// Default: 2 hours
    #[serde(rename = "stale_after_ms", with = "crate::config::duration_ms")]
    pub stale_after: Duration,

    /// Maximum time allowed for one collaborator call (git, gh, check
    /// command, tracker I/O) made during verification.
    /// Default: 60 seconds
    #[serde(rename = "command_timeout_ms", with = "crate::config::duration_ms")]
    pub command_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(600),
            batch_timeout: Duration::from_secs(1800),
            stale_after: Duration::from_secs(2 * 60 * 60),
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl TimeoutConfig {
    /// Creates a new TimeoutConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-invocation timeout.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    /// Sets the sub-batch timeout.
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = timeout;
        self
    }

    /// Sets the stale in-flight threshold.
    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    /// Sets the collaborator command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// The effective timeout for one invocation: a per-kind override capped by the batch timeout.
    pub fn effective_invocation_timeout(&self, profile_override: Option<Duration>) -> Duration {
        profile_override
            .unwrap_or(self.invocation_timeout)
            .min(self.batch_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_invocation_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.invocation_timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_default_batch_timeout() {
        let config = TimeoutConfig::default();
        assert_eq!(config.batch_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_default_stale_after_is_two_hours() {
        let config = TimeoutConfig::default();
        assert_eq!(config.stale_after, Duration::from_secs(7200));
    }

    #[test]
    fn test_new_returns_default() {
        assert_eq!(TimeoutConfig::new(), TimeoutConfig::default());
    }

    #[test]
    fn test_builder_pattern() {
        let config = TimeoutConfig::new()
            .with_invocation_timeout(Duration::from_secs(30))
            .with_batch_timeout(Duration::from_secs(90))
            .with_stale_after(Duration::from_secs(600))
            .with_command_timeout(Duration::from_secs(5));

        assert_eq!(config.invocation_timeout, Duration::from_secs(30));
        assert_eq!(config.batch_timeout, Duration::from_secs(90));
        assert_eq!(config.stale_after, Duration::from_secs(600));
        assert_eq!(config.command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_effective_timeout_is_capped_by_batch() {
        let config = TimeoutConfig::new().with_batch_timeout(Duration::from_secs(100));
        assert_eq!(
            config.effective_invocation_timeout(None),
            Duration::from_secs(100)
        );
        assert_eq!(
            config.effective_invocation_timeout(Some(Duration::from_secs(10))),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_serializes_as_milliseconds() {
        let json = serde_json::to_value(TimeoutConfig::default()).expect("serialize");
        assert_eq!(json["command_timeout_ms"], 60_000);

        let parsed: TimeoutConfig =
            serde_json::from_value(serde_json::json!({"invocation_timeout_ms": 1500}))
                .expect("deserialize");
        assert_eq!(parsed.invocation_timeout, Duration::from_millis(1500));
        assert_eq!(parsed.batch_timeout, Duration::from_secs(1800));
    }
}
