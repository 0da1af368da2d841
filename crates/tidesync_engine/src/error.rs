//! Error types for the sync engine.

use thiserror::Error;
use tidesync_protocol::{ProtocolError, RecordId};
use tidesync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced to callers of the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The local store could not be read or written.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] StorageError),

    /// Transport error, timeout or server-side fault.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// No usable credential, or the server refused it.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The server holds a different version of the record.
    #[error("version conflict on {table}/{id}")]
    VersionConflict {
        /// Table of the record.
        table: String,
        /// Record identifier.
        id: RecordId,
    },

    /// A request or mutation is invalid.
    #[error("validation failure: {0}")]
    ValidationFailure(String),

    /// The same kind of sync work is already running.
    #[error("already in progress: {0}")]
    AlreadyInProgress(String),

    /// The caller cancelled the cycle.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Returns true if retrying the same work later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::NetworkFailure(_))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Codec(message) => {
                SyncError::StorageFailure(StorageError::Codec(message))
            }
            other => SyncError::ValidationFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_protocol::OperationKind;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::NetworkFailure("connection reset".into()).is_retryable());
        assert!(!SyncError::Unauthenticated("expired".into()).is_retryable());
        assert!(!SyncError::ValidationFailure("bad".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::StorageFailure(StorageError::Poisoned).is_retryable());
    }

    #[test]
    fn protocol_errors_map_to_public_kinds() {
        let collapse = ProtocolError::InvalidCollapse {
            table: "notes".into(),
            id: RecordId::from("a1"),
            pending: OperationKind::Delete,
            new: OperationKind::Update,
        };
        assert!(matches!(
            SyncError::from(collapse),
            SyncError::ValidationFailure(_)
        ));
        assert!(matches!(
            SyncError::from(ProtocolError::Codec("eof".into())),
            SyncError::StorageFailure(StorageError::Codec(_))
        ));
    }

    #[test]
    fn error_display() {
        let err = SyncError::VersionConflict {
            table: "notes".into(),
            id: RecordId::from(4i64),
        };
        assert_eq!(err.to_string(), "version conflict on notes/4");
    }
}
