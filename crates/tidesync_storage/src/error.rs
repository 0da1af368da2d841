//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Stored bytes could not be interpreted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A batch or value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A frame exceeds the maximum frame size.
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge {
        /// Encoded frame body size.
        size: usize,
        /// Maximum allowed body size.
        limit: usize,
    },

    /// A previous write failed and could not be rolled back.
    #[error("store is poisoned after a failed write")]
    Poisoned,
}
