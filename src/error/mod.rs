//! Engine-level error type and failure classification.

pub mod classification;

pub use classification::{classify_message, Classify, ErrorCategory};

use thiserror::Error;

use crate::breaker::BreakerOpenError;
use crate::config::ConfigError;
use crate::conflict::ConflictError;
use crate::ports::PortError;
use crate::state::StateError;
use crate::store::StoreError;

/// Errors surfaced by the orchestrator to its drivers.
///
/// Verification failures are deliberately absent: an unverified invocation is
/// a normal outcome reported in a [`crate::BatchReport`], not an error.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error(transparent)]
    BreakerOpen(#[from] BreakerOpenError),

    #[error("no archived invocation found for task '{0}'")]
    NothingToVerify(String),
}

/// Result alias for orchestrator operations.
pub type EngineResult<T> = Result<T, EngineError>;
