//! Typed local store.
//!
//! [`LocalStore`] maps records, pending operations, cursors and conflicts
//! onto the tables of a [`TableStore`]. Application tables hold records keyed
//! by [`RecordId::storage_key`]; engine state lives in reserved tables whose
//! names start with `__`.

use crate::error::{SyncError, SyncResult};
use std::path::Path;
use tidesync_protocol::{
    from_cbor, to_cbor, ConflictRecord, PendingOperation, QueryCursor, Record, RecordId,
};
use tidesync_storage::{
    CompactionPolicy, FileBackend, StorageBackend, TableScan, TableStore, WriteBatch,
};

const OPERATIONS_TABLE: &str = "__operations";
const CURSORS_TABLE: &str = "__cursors";
const CONFLICTS_TABLE: &str = "__conflicts";
const META_TABLE: &str = "__meta";
const NEXT_SEQUENCE_KEY: &str = "next_sequence";

fn sequence_key(sequence: u64) -> String {
    format!("{sequence:020}")
}

/// Rejects names that are empty or collide with reserved tables.
pub fn check_table_name(table: &str) -> SyncResult<()> {
    if table.is_empty() {
        return Err(SyncError::ValidationFailure("table name is empty".into()));
    }
    if table.starts_with("__") {
        return Err(SyncError::ValidationFailure(format!(
            "table name {table:?} is reserved"
        )));
    }
    Ok(())
}

/// Durable store of records and engine state.
///
/// Reads are served from memory. Writes go through [`StoreBatch`] so that a
/// record and the bookkeeping that goes with it land in one frame.
///
/// # Example
///
/// ```rust
/// use tidesync_engine::LocalStore;
/// use tidesync_protocol::Record;
/// use serde_json::json;
///
/// let mut store = LocalStore::in_memory();
/// store.upsert(&Record::new("notes", "a1", json!({"text": "hi"}))).unwrap();
/// assert!(store.get("notes", &"a1".into()).unwrap().is_some());
/// ```
#[derive(Debug)]
pub struct LocalStore {
    tables: TableStore,
}

impl LocalStore {
    /// Opens (or creates) a file-backed store.
    pub fn open(path: &Path) -> SyncResult<Self> {
        let backend = FileBackend::open_with_create_dirs(path)?;
        Self::with_backend(Box::new(backend))
    }

    /// Opens a store on any backend.
    pub fn with_backend(backend: Box<dyn StorageBackend>) -> SyncResult<Self> {
        Ok(Self {
            tables: TableStore::open(backend)?,
        })
    }

    /// Creates an empty in-memory store.
    pub fn in_memory() -> Self {
        Self {
            tables: TableStore::in_memory(),
        }
    }

    /// Sets when the store's log is compacted.
    pub fn with_compaction(mut self, policy: CompactionPolicy) -> Self {
        self.tables.set_compaction(policy);
        self
    }

    /// Folds the store's log into a single frame now.
    pub fn compact(&mut self) -> SyncResult<()> {
        self.tables.compact()?;
        Ok(())
    }

    /// Returns a record.
    pub fn get(&self, table: &str, id: &RecordId) -> SyncResult<Option<Record>> {
        self.tables
            .get(table, &id.storage_key())
            .map(Record::decode)
            .transpose()
            .map_err(SyncError::from)
    }

    /// Lazily iterates the records of a table that satisfy `predicate`.
    ///
    /// The iterator is finite and can be cloned to restart from the current
    /// position.
    pub fn query<P>(&self, table: &str, predicate: P) -> Records<'_, P>
    where
        P: Fn(&Record) -> bool + Clone,
    {
        Records {
            scan: self.tables.scan(table),
            predicate,
        }
    }

    /// Number of records in a table.
    pub fn count(&self, table: &str) -> usize {
        self.tables.table_len(table)
    }

    /// Writes or replaces a single record.
    ///
    /// Reserved tables are refused; engine state only changes through
    /// [`StoreBatch`].
    pub fn upsert(&mut self, record: &Record) -> SyncResult<()> {
        check_table_name(&record.table)?;
        let mut batch = StoreBatch::new();
        batch.upsert(record)?;
        self.commit(batch)
    }

    /// Deletes a single record.
    pub fn delete(&mut self, table: &str, id: &RecordId) -> SyncResult<()> {
        check_table_name(table)?;
        let mut batch = StoreBatch::new();
        batch.delete(table, id);
        self.commit(batch)
    }

    /// Durably applies a batch.
    pub fn commit(&mut self, batch: StoreBatch) -> SyncResult<()> {
        self.tables.write(batch.inner)?;
        Ok(())
    }

    /// Loads every persisted pending operation in sequence order.
    pub fn operations(&self) -> SyncResult<Vec<PendingOperation>> {
        self.tables
            .scan(OPERATIONS_TABLE)
            .map(|(_, bytes)| PendingOperation::decode(bytes).map_err(SyncError::from))
            .collect()
    }

    /// Loads the persisted sequence counter (1 for a fresh store).
    pub fn next_sequence(&self) -> SyncResult<u64> {
        match self.tables.get(META_TABLE, NEXT_SEQUENCE_KEY) {
            Some(bytes) => Ok(from_cbor(bytes)?),
            None => Ok(1),
        }
    }

    /// Loads a query cursor.
    pub fn cursor(&self, query_id: &str) -> SyncResult<Option<QueryCursor>> {
        self.tables
            .get(CURSORS_TABLE, query_id)
            .map(QueryCursor::decode)
            .transpose()
            .map_err(SyncError::from)
    }

    /// Loads every persisted conflict.
    pub fn conflicts(&self) -> SyncResult<Vec<ConflictRecord>> {
        self.tables
            .scan(CONFLICTS_TABLE)
            .map(|(_, bytes)| ConflictRecord::decode(bytes).map_err(SyncError::from))
            .collect()
    }
}

/// Lazy, restartable record iterator returned by [`LocalStore::query`].
#[derive(Clone)]
pub struct Records<'a, P> {
    scan: TableScan<'a>,
    predicate: P,
}

impl<P> Iterator for Records<'_, P>
where
    P: Fn(&Record) -> bool,
{
    type Item = SyncResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        for (_, bytes) in self.scan.by_ref() {
            match Record::decode(bytes) {
                Ok(record) if (self.predicate)(&record) => return Some(Ok(record)),
                Ok(_) => continue,
                Err(err) => return Some(Err(err.into())),
            }
        }
        None
    }
}

/// A set of mutations committed atomically by [`LocalStore::commit`].
#[derive(Debug, Default)]
pub struct StoreBatch {
    inner: WriteBatch,
}

impl StoreBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if nothing was staged.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Stages a record write.
    pub fn upsert(&mut self, record: &Record) -> SyncResult<()> {
        self.inner
            .put(&record.table, record.id.storage_key(), record.encode()?);
        Ok(())
    }

    /// Stages a record delete.
    pub fn delete(&mut self, table: &str, id: &RecordId) {
        self.inner.delete(table, id.storage_key());
    }

    /// Stages removal of every record of a table.
    pub fn clear_table(&mut self, table: &str) {
        self.inner.clear_table(table);
    }

    /// Stages a pending operation write.
    pub fn put_operation(&mut self, op: &PendingOperation) -> SyncResult<()> {
        self.inner
            .put(OPERATIONS_TABLE, sequence_key(op.sequence), op.encode()?);
        Ok(())
    }

    /// Stages removal of a pending operation.
    pub fn remove_operation(&mut self, sequence: u64) {
        self.inner.delete(OPERATIONS_TABLE, sequence_key(sequence));
    }

    /// Stages the sequence counter.
    pub fn set_next_sequence(&mut self, next: u64) -> SyncResult<()> {
        self.inner.put(META_TABLE, NEXT_SEQUENCE_KEY, to_cbor(&next)?);
        Ok(())
    }

    /// Stages a cursor write.
    pub fn put_cursor(&mut self, cursor: &QueryCursor) -> SyncResult<()> {
        self.inner
            .put(CURSORS_TABLE, cursor.query_id.as_str(), cursor.encode()?);
        Ok(())
    }

    /// Stages removal of a cursor.
    pub fn remove_cursor(&mut self, query_id: &str) {
        self.inner.delete(CURSORS_TABLE, query_id);
    }

    /// Stages a conflict write.
    pub fn put_conflict(&mut self, conflict: &ConflictRecord) -> SyncResult<()> {
        self.inner.put(
            CONFLICTS_TABLE,
            sequence_key(conflict.sequence()),
            conflict.encode()?,
        );
        Ok(())
    }

    /// Stages removal of a conflict.
    pub fn remove_conflict(&mut self, sequence: u64) {
        self.inner.delete(CONFLICTS_TABLE, sequence_key(sequence));
    }
}
