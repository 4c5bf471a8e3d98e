//! Narrow interfaces to the external systems the engine re-reads for ground truth.
//!
//! The engine never writes to the version-control host or the CI runner. The
//! task tracker is written only to mirror persisted transitions.

mod command;
mod file_tracker;
mod git;
pub mod memory;

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::error::{classify_message, Classify, ErrorCategory};

pub use command::CommandCheckRunner;
pub use file_tracker::FileTracker;
pub use git::GitHost;

/// Field map of a tracker record.
pub type Fields = Map<String, Value>;

/// Failures talking to an external collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl PortError {
    /// Map free-form collaborator output onto a variant.
    pub fn from_message(message: &str) -> Self {
        match classify_message(message) {
            ErrorCategory::Timeout(detail) => PortError::Timeout {
                operation: detail,
                after: Duration::ZERO,
            },
            ErrorCategory::RateLimited(detail) => PortError::RateLimited(detail),
            ErrorCategory::Transient(detail) => PortError::Unavailable(detail),
            ErrorCategory::Permanent(detail) => {
                let lower = detail.to_lowercase();
                if lower.contains("unauthorized") || lower.contains("401") || lower.contains("403") {
                    PortError::Unauthorized(detail)
                } else if lower.contains("not found") || lower.contains("404") {
                    PortError::NotFound(detail)
                } else {
                    PortError::InvalidInput(detail)
                }
            }
        }
    }
}

impl Classify for PortError {
    fn classify(&self) -> ErrorCategory {
        let detail = self.to_string();
        match self {
            PortError::Timeout { .. } => ErrorCategory::Timeout(detail),
            PortError::RateLimited(_) => ErrorCategory::RateLimited(detail),
            PortError::Unavailable(_) => ErrorCategory::Transient(detail),
            PortError::Unauthorized(_) | PortError::InvalidInput(_) | PortError::NotFound(_) => {
                ErrorCategory::Permanent(detail)
            }
        }
    }
}

/// Result type for collaborator calls.
pub type PortResult<T> = Result<T, PortError>;

/// State of a pull request on the version-control host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl std::str::FromStr for PrState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "open" => Ok(PrState::Open),
            "closed" => Ok(PrState::Closed),
            "merged" => Ok(PrState::Merged),
            other => Err(format!("unknown pull request state '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub state: PrState,
}

/// Outcome of re-running automated checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    pub exit_code: i32,
    pub output: String,
}

impl CheckRun {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// External task tracker holding records of work.
#[async_trait]
pub trait TaskTracker: Send + Sync {
    async fn create_record(&self, fields: Fields) -> PortResult<String>;

    /// Merge `fields` into an existing record. Missing records are `NotFound`.
    async fn update_record(&self, id: &str, fields: Fields) -> PortResult<()>;

    /// Current fields of a record, or `None` if it does not exist.
    async fn query_record(&self, id: &str) -> PortResult<Option<Fields>>;
}

/// Read-only view of the version-control host.
#[async_trait]
pub trait VcsHost: Send + Sync {
    async fn branch_exists(&self, name: &str) -> PortResult<bool>;

    async fn commit_exists(&self, reference: &str) -> PortResult<bool>;

    async fn pr_exists(&self, number: u64) -> PortResult<Option<PullRequest>>;
}

/// Test/CI runner able to re-run checks for a target.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run_checks(&self, target: &str) -> PortResult<CheckRun>;
}

/// Run an external program with a deadline. The child is killed if the deadline passes.
pub(crate) async fn run_program(
    program: &str,
    args: &[&str],
    cwd: &Path,
    timeout: Duration,
) -> PortResult<Output> {
    debug!(program, args = ?args, dir = %cwd.display(), "Running collaborator command");

    let mut command = Command::new(program);
    command.args(args).current_dir(cwd).kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => Err(PortError::Unavailable(
            format!("'{}' is not installed or not on PATH", program),
        )),
        Ok(Err(err)) => Err(PortError::Unavailable(format!(
            "failed to run '{}': {}",
            program, err
        ))),
        Err(_) => Err(PortError::Timeout {
            operation: format!("{} {}", program, args.join(" ")),
            after: timeout,
        }),
    }
}

/// Keep the tail of long command output for evidence.
pub(crate) fn tail(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut start = text.len() - max_len;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated, {} total bytes] ...{}", text.len(), &text[start..])
}
