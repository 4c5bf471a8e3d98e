//! Local persistence: the append-only state log and the evidence archive.

mod evidence;
mod log;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use evidence::{EvidenceRecord, EvidenceStore};
pub use log::{LogEntry, StateLog, TaskDefinition};

/// Errors that can occur while persisting or replaying engine state.
#[derive(Error, Debug)]
pub enum StoreError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A line in the middle of a log could not be replayed.
    #[error("corrupt log {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Identifier that cannot be used as a file name.
    #[error("invalid identifier '{0}'")]
    InvalidId(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Identifiers end up in file names; keep them to a safe alphabet.
pub(crate) fn validate_id(id: &str) -> StoreResult<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}
