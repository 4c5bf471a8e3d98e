//! Per-resource circuit breakers.
//!
//! A breaker gates every call to one external resource through
//! `CLOSED -> OPEN -> HALF_OPEN -> CLOSED`. While open, calls fail fast with
//! [`BreakerOpenError`] and never reach the resource. After the recovery
//! timeout a bounded number of trial calls is admitted; callers arriving once
//! that budget is used up wait until a trial settles and then re-evaluate.

pub mod retry;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Classify, ErrorCategory};

pub use retry::{call_with_retry, RetryPolicy};

/// Gate status of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerStatus {
    pub fn as_label(self) -> &'static str {
        match self {
            BreakerStatus::Closed => "CLOSED",
            BreakerStatus::Open => "OPEN",
            BreakerStatus::HalfOpen => "HALF_OPEN",
        }
    }
}

/// Thresholds for a single breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Qualifying failures within `window` that open the breaker.
    /// Default: 5
    pub failure_threshold: u32,

    /// Failure counting window.
    /// Default: 60 seconds
    #[serde(rename = "window_ms", with = "crate::config::duration_ms")]
    pub window: Duration,

    /// Time spent open before trial calls are admitted.
    /// Default: 30 seconds
    #[serde(rename = "recovery_timeout_ms", with = "crate::config::duration_ms")]
    pub recovery_timeout: Duration,

    /// Trial calls admitted while half-open.
    /// Default: 3
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }
}

/// Returned instead of calling the resource while its breaker is open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit breaker for '{resource}' is open; retry in {}ms", .retry_after.as_millis())]
pub struct BreakerOpenError {
    pub resource: String,
    pub retry_after: Duration,
}

/// Failure of a breaker-guarded call.
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The call was short-circuited; the resource was not contacted.
    #[error(transparent)]
    Open(#[from] BreakerOpenError),

    /// The resource was called and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }
}

/// Mutable state of one breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub resource_id: String,
    pub status: BreakerStatus,
    pub failure_count: u32,
    pub window_start: Option<Instant>,
    pub opened_at: Option<Instant>,
    pub half_open_in_flight: u32,
    pub half_open_successes: u32,
}

impl CircuitBreakerState {
    fn new(resource_id: String) -> Self {
        Self {
            resource_id,
            status: BreakerStatus::Closed,
            failure_count: 0,
            window_start: None,
            opened_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }

    fn close(&mut self) {
        self.status = BreakerStatus::Closed;
        self.failure_count = 0;
        self.window_start = None;
        self.opened_at = None;
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
    }

    fn open(&mut self, now: Instant) {
        self.status = BreakerStatus::Open;
        self.opened_at = Some(now);
        self.half_open_in_flight = 0;
        self.half_open_successes = 0;
    }
}

/// Serializable view of a breaker for status reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub resource_id: String,
    pub status: BreakerStatus,
    pub failure_count: u32,
    /// Remaining time before trial calls are admitted, when open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// How a guarded call ended, from the breaker's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Caller-side error: neither counted nor resetting.
    Neutral,
}

/// Circuit breaker for a single external resource.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<CircuitBreakerState>,
    settled: Notify,
}

impl CircuitBreaker {
    pub fn new(resource_id: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CircuitBreakerState::new(resource_id.into())),
            settled: Notify::new(),
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn resource_id(&self) -> String {
        self.lock().resource_id.clone()
    }

    pub fn status(&self) -> BreakerStatus {
        self.lock().status
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        let retry_after_ms = match (state.status, state.opened_at) {
            (BreakerStatus::Open, Some(opened_at)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerSnapshot {
            resource_id: state.resource_id.clone(),
            status: state.status,
            failure_count: state.failure_count,
            retry_after_ms,
        }
    }

    /// Whether a call made now would be short-circuited.
    pub fn is_open(&self) -> bool {
        let state = self.lock();
        match (state.status, state.opened_at) {
            (BreakerStatus::Open, Some(opened_at)) => {
                opened_at.elapsed() < self.config.recovery_timeout
            }
            _ => false,
        }
    }

    /// Run `call` through the breaker.
    ///
    /// Only failures whose category counts toward the breaker are recorded.
    /// A trial call that is dropped before completing counts as a failure.
    pub async fn execute<T, E, F, Fut>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.admit().await?;
        match call().await {
            Ok(value) => {
                permit.settle(Outcome::Success);
                Ok(value)
            }
            Err(err) => {
                let category = err.classify();
                permit.settle(outcome_for(&category));
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        // A poisoned lock only means a panic elsewhere; the counters stay usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn admit(&self) -> Result<BreakerPermit<'_>, BreakerOpenError> {
        loop {
            let waiting = {
                let mut state = self.lock();
                let now = Instant::now();

                if state.status == BreakerStatus::Open {
                    let opened_at = state.opened_at.unwrap_or(now);
                    let elapsed = now.saturating_duration_since(opened_at);
                    if elapsed < self.config.recovery_timeout {
                        return Err(BreakerOpenError {
                            resource: state.resource_id.clone(),
                            retry_after: self.config.recovery_timeout - elapsed,
                        });
                    }
                    info!(resource = %state.resource_id, "Circuit breaker half-open, admitting trial calls");
                    state.status = BreakerStatus::HalfOpen;
                    state.half_open_in_flight = 0;
                    state.half_open_successes = 0;
                }

                match state.status {
                    BreakerStatus::Closed => {
                        return Ok(BreakerPermit::new(self, false));
                    }
                    BreakerStatus::HalfOpen => {
                        let used = state.half_open_in_flight + state.half_open_successes;
                        if used < self.config.half_open_max_calls {
                            state.half_open_in_flight += 1;
                            debug!(
                                resource = %state.resource_id,
                                in_flight = state.half_open_in_flight,
                                "Admitted half-open trial call"
                            );
                            return Ok(BreakerPermit::new(self, true));
                        }
                        // Registered before the lock is released so no settle is missed.
                        self.settled.notified()
                    }
                    BreakerStatus::Open => continue,
                }
            };
            waiting.await;
        }
    }

    fn record(&self, trial: bool, outcome: Outcome) {
        let mut state = self.lock();
        let now = Instant::now();

        match (state.status, trial) {
            (BreakerStatus::Closed, false) => match outcome {
                Outcome::Success => {
                    state.failure_count = 0;
                    state.window_start = None;
                }
                Outcome::Failure => {
                    let window_expired = state
                        .window_start
                        .map(|start| now.saturating_duration_since(start) > self.config.window)
                        .unwrap_or(true);
                    if window_expired {
                        state.window_start = Some(now);
                        state.failure_count = 0;
                    }
                    state.failure_count += 1;
                    if state.failure_count >= self.config.failure_threshold {
                        warn!(
                            resource = %state.resource_id,
                            failures = state.failure_count,
                            threshold = self.config.failure_threshold,
                            "Circuit breaker opened"
                        );
                        state.open(now);
                    }
                }
                Outcome::Neutral => {}
            },
            (BreakerStatus::HalfOpen, true) => {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                match outcome {
                    Outcome::Success => {
                        state.half_open_successes += 1;
                        if state.half_open_in_flight == 0
                            || state.half_open_successes >= self.config.half_open_max_calls
                        {
                            info!(resource = %state.resource_id, "Circuit breaker closed after successful trials");
                            state.close();
                        }
                    }
                    Outcome::Failure => {
                        warn!(resource = %state.resource_id, "Trial call failed, circuit breaker re-opened");
                        state.open(now);
                    }
                    Outcome::Neutral => {}
                }
                drop(state);
                self.settled.notify_waiters();
            }
            // Stale outcome from a call admitted under a previous status.
            _ => {}
        }
    }
}

fn outcome_for(category: &ErrorCategory) -> Outcome {
    if category.counts_toward_breaker() {
        Outcome::Failure
    } else {
        Outcome::Neutral
    }
}

/// Admission to call the resource. Settles as a failure if dropped unsettled.
struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.trial, outcome);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.record(true, Outcome::Failure);
        }
    }
}

/// One breaker per external resource, sharing defaults with per-resource overrides.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            overrides: HashMap::new(),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Use `config` instead of the defaults for `resource`.
    pub fn with_override(mut self, resource: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(resource.into(), config);
        self
    }

    /// The breaker for `resource`, created on first use.
    pub fn get(&self, resource: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(resource)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                Arc::new(CircuitBreaker::new(resource, config))
            })
            .clone()
    }

    pub async fn execute<T, E, F, Fut>(&self, resource: &str, call: F) -> Result<T, BreakerError<E>>
    where
        E: Classify,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.get(resource).execute(call).await
    }

    /// Whether `resource` would currently short-circuit. Unknown resources are closed.
    pub fn is_open(&self, resource: &str) -> bool {
        let breakers = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        breakers.get(resource).map(|b| b.is_open()).unwrap_or(false)
    }

    /// Snapshots of every breaker created so far, sorted by resource id.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        snapshots
    }
}
