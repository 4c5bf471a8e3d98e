//! Engine configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `TASKGATE_*` environment variables (`__` separates nested keys,
//! e.g. `TASKGATE_LIMITS__MAX_CONCURRENCY=5`).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::{BreakerConfig, BreakerRegistry, RetryPolicy};
use crate::conflict::ConflictPolicy;
use crate::hooks::HookPolicy;
use crate::limiter::LimitsConfig;
use crate::model::WorkerKind;
use crate::timeout::TimeoutConfig;
use crate::verify::VerificationConfig;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "TASKGATE";

/// Default file name looked up by the CLI.
pub const CONFIG_FILE_NAME: &str = "taskgate.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How to run one kind of worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProfile {
    /// Shell command run for each assignment of this kind.
    pub command: String,
    /// Per-invocation timeout; falls back to `timeouts.invocation_timeout_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Apply verified transitions without asking.
    /// Default: true
    #[serde(default = "default_true")]
    pub auto_apply: bool,
    /// Treat every assignment of this kind as destructive.
    /// Default: false
    #[serde(default)]
    pub destructive: bool,
}

fn default_true() -> bool {
    true
}

impl WorkerProfile {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_ms: None,
            auto_apply: true,
            destructive: false,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of everything the engine persists.
    /// Default: ".taskgate"
    pub state_dir: PathBuf,
    /// Directory claimed files are checked against and workers run in.
    /// Default: "."
    pub workspace_root: PathBuf,
    /// Shell command re-running automated checks; `{target}` is substituted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks_command: Option<String>,
    pub conflict_policy: ConflictPolicy,
    pub limits: LimitsConfig,
    pub breaker: BreakerConfig,
    /// Per-resource breaker settings, keyed by resource id.
    pub breaker_overrides: BTreeMap<String, BreakerConfig>,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutConfig,
    pub verification: VerificationConfig,
    /// Worker profiles keyed by worker kind (`build`, `review`, ...).
    pub workers: BTreeMap<String, WorkerProfile>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".taskgate"),
            workspace_root: PathBuf::from("."),
            checks_command: None,
            conflict_policy: ConflictPolicy::default(),
            limits: LimitsConfig::default(),
            breaker: BreakerConfig::default(),
            breaker_overrides: BTreeMap::new(),
            retry: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
            verification: VerificationConfig::default(),
            workers: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path` if given (it must exist), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        let config: Self = builder
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_concurrency == 0 {
            return Err(ConfigError::Invalid("limits.max_concurrency must be at least 1".into()));
        }
        if self.limits.per_resource_limit == 0 {
            return Err(ConfigError::Invalid("limits.per_resource_limit must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        validate_breaker("breaker", &self.breaker)?;
        for (resource, breaker) in &self.breaker_overrides {
            validate_breaker(&format!("breaker_overrides.{}", resource), breaker)?;
        }

        let timeouts = [
            ("invocation_timeout_ms", self.timeouts.invocation_timeout),
            ("batch_timeout_ms", self.timeouts.batch_timeout),
            ("stale_after_ms", self.timeouts.stale_after),
            ("command_timeout_ms", self.timeouts.command_timeout),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| value.is_zero()) {
            return Err(ConfigError::Invalid(format!("timeouts.{} must be greater than zero", name)));
        }

        for (key, profile) in &self.workers {
            key.parse::<WorkerKind>()
                .map_err(|e| ConfigError::Invalid(format!("workers.{}: {}", key, e)))?;
            if profile.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("workers.{}.command is empty", key)));
            }
            if profile.timeout_ms == Some(0) {
                return Err(ConfigError::Invalid(format!("workers.{}.timeout_ms must be greater than zero", key)));
            }
        }
        Ok(())
    }

    /// Serialize to TOML, e.g. for `taskgate init-config`.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn with_workspace_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workspace_root = dir.into();
        self
    }

    pub fn with_checks_command(mut self, command: impl Into<String>) -> Self {
        self.checks_command = Some(command.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_breaker_override(mut self, resource: impl Into<String>, breaker: BreakerConfig) -> Self {
        self.breaker_overrides.insert(resource.into(), breaker);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_worker(mut self, kind: WorkerKind, profile: WorkerProfile) -> Self {
        self.workers.insert(kind.as_label().to_string(), profile);
        self
    }

    pub fn worker_profile(&self, kind: WorkerKind) -> Option<&WorkerProfile> {
        self.workers.get(kind.as_label())
    }

    /// Where the transition log lives.
    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("state")
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.state_dir.join("evidence")
    }

    pub fn tracker_dir(&self) -> PathBuf {
        self.state_dir.join("tracker")
    }

    /// Breaker registry with the configured defaults and overrides.
    pub fn breaker_registry(&self) -> BreakerRegistry {
        self.breaker_overrides.iter().fold(
            BreakerRegistry::new(self.breaker.clone()),
            |registry, (resource, config)| registry.with_override(resource.clone(), config.clone()),
        )
    }

    /// Auto-apply policy: the default, adjusted by each worker profile.
    pub fn hook_policy(&self) -> HookPolicy {
        WorkerKind::ALL.into_iter().fold(HookPolicy::default(), |policy, kind| {
            match self.worker_profile(kind) {
                Some(profile) => policy.with_auto_apply(kind, profile.auto_apply),
                None => policy,
            }
        })
    }
}

fn validate_breaker(name: &str, breaker: &BreakerConfig) -> Result<(), ConfigError> {
    if breaker.failure_threshold == 0 {
        return Err(ConfigError::Invalid(format!("{}.failure_threshold must be at least 1", name)));
    }
    if breaker.half_open_max_calls == 0 {
        return Err(ConfigError::Invalid(format!("{}.half_open_max_calls must be at least 1", name)));
    }
    if breaker.window.is_zero() {
        return Err(ConfigError::Invalid(format!("{}.window_ms must be greater than zero", name)));
    }
    Ok(())
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
