//! Error types for the protocol crate.

use crate::operation::OperationKind;
use crate::record::RecordId;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by the data model and the operation log.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A persisted value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A new mutation cannot be combined with the pending one.
    #[error("cannot apply {new:?} to {table}/{id}: a {pending:?} is already pending")]
    InvalidCollapse {
        /// Table of the record.
        table: String,
        /// Record identifier.
        id: RecordId,
        /// Kind of the pending operation.
        pending: OperationKind,
        /// Kind of the rejected mutation.
        new: OperationKind,
    },

    /// An operation is missing data its kind requires.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// No operation with this sequence number exists.
    #[error("no pending operation with sequence {0}")]
    UnknownSequence(u64),
}
