//! Error types for manusync-sync.

use std::path::PathBuf;

use thiserror::Error;

use manusync_core::{ConfigError, RecordId, Side, SyncPhase};

/// All errors that can arise from sync operations.
///
/// [`SyncError::is_retryable`] splits the taxonomy into transient failures
/// (fed to the retry queue) and permanent ones (surfaced to alerting).
#[derive(Debug, Error)]
pub enum SyncError {
    /// The record lease could not be taken within the configured waits.
    #[error("lock for record {record_id} not acquired after {attempts} attempt(s)")]
    LockTimeout { record_id: RecordId, attempts: u32 },

    /// The lease expired and another holder took the record.
    #[error("lease on record {record_id} lost to another holder")]
    LeaseLost { record_id: RecordId },

    /// An adapter call failed or timed out.
    #[error("{side} adapter unavailable: {reason}")]
    AdapterUnavailable { side: Side, reason: String },

    /// Optimistic concurrency check failed on an adapter write.
    #[error("{side} revision conflict: expected {expected}, found {actual}")]
    RevisionConflict {
        side: Side,
        expected: u64,
        actual: u64,
    },

    /// The attempt ran past its overall deadline before commit.
    #[error("deadline exceeded while {phase}")]
    DeadlineExceeded { phase: SyncPhase },

    /// Stored state contradicts itself; needs an operator.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// A decision was submitted for a field that is not escalated.
    #[error("no open escalation for field '{field}' of record {record_id}")]
    NoOpenEscalation { record_id: RecordId, field: String },

    /// The orchestrator was built without a required collaborator.
    #[error("orchestrator is missing its {0}")]
    MissingCollaborator(&'static str),

    /// An error from the configuration layer.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error in a file-backed store.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Transient errors are retried by the orchestrator's retry queue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::LockTimeout { .. }
                | SyncError::LeaseLost { .. }
                | SyncError::AdapterUnavailable { .. }
                | SyncError::RevisionConflict { .. }
                | SyncError::DeadlineExceeded { .. }
                | SyncError::Io { .. }
        )
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, SyncError::Integrity(_))
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
