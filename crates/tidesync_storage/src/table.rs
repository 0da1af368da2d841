//! Named key/value tables over a framed backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::frame::{self, FRAME_HEADER_SIZE};
use crate::memory::InMemoryBackend;
use serde::{Deserialize, Serialize};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// A single change inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert or replace a value.
    Put {
        /// Table name.
        table: String,
        /// Key within the table.
        key: String,
        /// Opaque value bytes.
        value: Vec<u8>,
    },
    /// Remove a key (no-op if absent).
    Delete {
        /// Table name.
        table: String,
        /// Key within the table.
        key: String,
    },
    /// Remove every key of a table.
    ClearTable {
        /// Table name.
        table: String,
    },
}

/// A group of mutations that become durable together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put.
    pub fn put(&mut self, table: impl Into<String>, key: impl Into<String>, value: Vec<u8>) {
        self.mutations.push(Mutation::Put {
            table: table.into(),
            key: key.into(),
            value,
        });
    }

    /// Queues a delete.
    pub fn delete(&mut self, table: impl Into<String>, key: impl Into<String>) {
        self.mutations.push(Mutation::Delete {
            table: table.into(),
            key: key.into(),
        });
    }

    /// Queues removal of a whole table.
    pub fn clear_table(&mut self, table: impl Into<String>) {
        self.mutations.push(Mutation::ClearTable {
            table: table.into(),
        });
    }

    /// Appends all mutations of another batch.
    pub fn extend(&mut self, other: WriteBatch) {
        self.mutations.extend(other.mutations);
    }

    /// Returns the number of queued mutations.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Returns the queued mutations.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }
}

/// When a [`TableStore`] folds its log into a single frame.
///
/// Every batch appends a frame, so overwritten and deleted values stay on
/// disk until compaction. The log is compacted once it has grown by
/// `min_growth` bytes since the last compaction and is at least
/// `growth_factor` times the size it had right after it; a store that only
/// gains live data is then rewritten at doubling points instead of on every
/// write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    /// Bytes appended since the last compaction before it runs again.
    pub min_growth: u64,
    /// Ratio of log size to compacted size before it runs again.
    pub growth_factor: u64,
}

impl CompactionPolicy {
    /// Creates a policy.
    pub fn new(min_growth: u64, growth_factor: u64) -> Self {
        Self {
            min_growth,
            growth_factor,
        }
    }

    fn is_due(&self, size: u64, compacted: u64) -> bool {
        size.saturating_sub(compacted) >= self.min_growth
            && size >= compacted.saturating_mul(self.growth_factor)
    }
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self::new(256 * 1024, 2)
    }
}

/// Key/value tables persisted as an append-only log of batches.
///
/// The full key space is held in memory and rebuilt by replaying frames on
/// open. A torn or corrupt tail (crash during a write) is truncated away, so
/// the store always reopens at the last fully written batch. Dead frames are
/// dropped by compaction (see [`CompactionPolicy`]), which rewrites the live
/// tables as one frame.
///
/// # Invariants
///
/// - A batch is applied in memory only after its frame was appended and synced
/// - A failed append is rolled back with `truncate`; if that fails too the
///   store refuses further writes ([`StorageError::Poisoned`])
/// - Compaction never changes what the store holds, only how it is laid out
pub struct TableStore {
    backend: Box<dyn StorageBackend>,
    tables: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    poisoned: bool,
    frames_replayed: usize,
    policy: CompactionPolicy,
    /// Log size right after the last compaction; a compacted log is one frame.
    compacted_len: u64,
    compactions: usize,
}

impl TableStore {
    /// Opens a store on the given backend, replaying existing frames.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        let recovered = frame::recover(backend.as_ref())?;
        let size = backend.size()?;
        if recovered.valid_len < size {
            tracing::warn!(
                valid_len = recovered.valid_len,
                size,
                "dropping torn tail from local store"
            );
            backend.truncate(recovered.valid_len)?;
        }

        let compacted_len = recovered
            .bodies
            .first()
            .map_or(0, |body| (FRAME_HEADER_SIZE + body.len()) as u64);
        let mut store = Self {
            backend,
            tables: BTreeMap::new(),
            poisoned: false,
            frames_replayed: recovered.bodies.len(),
            policy: CompactionPolicy::default(),
            compacted_len,
            compactions: 0,
        };

        for body in recovered.bodies {
            let batch: WriteBatch = ciborium::from_reader(body.as_slice())
                .map_err(|e| StorageError::Corrupted(format!("undecodable batch: {e}")))?;
            store.apply(batch);
        }

        tracing::debug!(
            frames = store.frames_replayed,
            tables = store.tables.len(),
            "local store opened"
        );
        Ok(store)
    }

    /// Creates an empty store backed by memory.
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(InMemoryBackend::new()),
            tables: BTreeMap::new(),
            poisoned: false,
            frames_replayed: 0,
            policy: CompactionPolicy::default(),
            compacted_len: 0,
            compactions: 0,
        }
    }

    /// Replaces the compaction policy.
    pub fn set_compaction(&mut self, policy: CompactionPolicy) {
        self.policy = policy;
    }

    /// Returns the number of compactions since the store was opened.
    pub fn compactions(&self) -> usize {
        self.compactions
    }

    /// Returns the size of the log in bytes.
    pub fn log_len(&self) -> StorageResult<u64> {
        self.backend.size()
    }

    /// Returns the number of frames replayed when the store was opened.
    pub fn frames_replayed(&self) -> usize {
        self.frames_replayed
    }

    /// Returns a value.
    pub fn get(&self, table: &str, key: &str) -> Option<&[u8]> {
        self.tables
            .get(table)
            .and_then(|t| t.get(key))
            .map(Vec::as_slice)
    }

    /// Returns true if the key exists.
    pub fn contains(&self, table: &str, key: &str) -> bool {
        self.get(table, key).is_some()
    }

    /// Iterates a table in key order.
    pub fn scan(&self, table: &str) -> TableScan<'_> {
        TableScan {
            inner: self.tables.get(table).map(|t| t.iter()),
        }
    }

    /// Returns the number of keys in a table.
    pub fn table_len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Returns the names of all non-empty tables.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .filter(|(_, t)| !t.is_empty())
            .map(|(name, _)| name.as_str())
    }

    /// Durably writes a batch, then applies it in memory.
    pub fn write(&mut self, batch: WriteBatch) -> StorageResult<()> {
        if self.poisoned {
            return Err(StorageError::Poisoned);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let framed = encode_batch(&batch)?;

        let start = self.backend.size()?;
        if let Err(err) = self
            .backend
            .append(&framed)
            .and_then(|_| self.backend.sync())
        {
            if self.backend.truncate(start).is_err() {
                self.poisoned = true;
            }
            return Err(err);
        }

        self.apply(batch);
        self.maybe_compact();
        Ok(())
    }

    /// Rewrites the log as a single frame holding every live key.
    pub fn compact(&mut self) -> StorageResult<()> {
        if self.poisoned {
            return Err(StorageError::Poisoned);
        }
        let before = self.backend.size()?;

        let mut snapshot = WriteBatch::new();
        for (table, entries) in &self.tables {
            for (key, value) in entries {
                snapshot.put(table.as_str(), key.as_str(), value.clone());
            }
        }
        let image = if snapshot.is_empty() {
            Vec::new()
        } else {
            encode_batch(&snapshot)?
        };

        self.backend.replace(&image)?;
        self.compacted_len = image.len() as u64;
        self.compactions += 1;
        tracing::debug!(
            before,
            after = self.compacted_len,
            keys = snapshot.len(),
            "local store compacted"
        );
        Ok(())
    }

    fn maybe_compact(&mut self) {
        let due = match self.backend.size() {
            Ok(size) => self.policy.is_due(size, self.compacted_len),
            Err(_) => false,
        };
        if !due {
            return;
        }
        // The batch that triggered this is already durable; a failed
        // compaction leaves the log as it was and waits for more growth.
        if let Err(err) = self.compact() {
            tracing::warn!(error = %err, "local store compaction failed");
            if let Ok(size) = self.backend.size() {
                self.compacted_len = size;
            }
        }
    }

    fn apply(&mut self, batch: WriteBatch) {
        for mutation in batch.mutations {
            match mutation {
                Mutation::Put { table, key, value } => {
                    self.tables.entry(table).or_default().insert(key, value);
                }
                Mutation::Delete { table, key } => {
                    if let Some(t) = self.tables.get_mut(&table) {
                        t.remove(&key);
                    }
                }
                Mutation::ClearTable { table } => {
                    self.tables.remove(&table);
                }
            }
        }
    }
}

fn encode_batch(batch: &WriteBatch) -> StorageResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(batch, &mut body).map_err(|e| StorageError::Codec(e.to_string()))?;
    frame::encode(&body)
}

impl std::fmt::Debug for TableStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableStore")
            .field("tables", &self.tables.len())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

/// Lazy iterator over one table in key order.
///
/// Cheap to clone; a clone replays the table from the clone's position.
#[derive(Clone)]
pub struct TableScan<'a> {
    inner: Option<btree_map::Iter<'a, String, Vec<u8>>>,
}

impl<'a> Iterator for TableScan<'a> {
    type Item = (&'a str, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner
            .as_mut()?
            .next()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}
