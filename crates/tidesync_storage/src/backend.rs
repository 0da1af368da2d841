//! Storage backend trait definition.

use crate::error::StorageResult;

/// A low-level byte store underneath a [`crate::TableStore`].
///
/// Backends only append, read back, make durable, cut off and wholesale
/// replace bytes. Framing,
/// checksums and table semantics all live in the table store.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously written at that offset
/// - after `sync` returns, all appended bytes survive process termination
/// - `truncate` never grows the store
/// - `replace` is atomic: the store holds either the old or the new content
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range extends past
    /// the current size, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the store and returns its offset.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Returns the current size in bytes (the offset of the next append).
    fn size(&self) -> StorageResult<u64>;

    /// Makes all appended data and metadata durable.
    fn sync(&mut self) -> StorageResult<()>;

    /// Cuts the store down to `new_size` bytes.
    ///
    /// Used to drop a torn tail during recovery and to roll back a partially
    /// written frame.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_size` is greater than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Replaces the whole content with `data` and makes it durable.
    ///
    /// Used by compaction. After a crash, or when this returns an error, the
    /// store holds either its old content or `data`, never a mix of both.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}
