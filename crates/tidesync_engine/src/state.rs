//! Shared engine state, in-flight guards and statistics.

use crate::error::{SyncError, SyncResult};
use crate::store::{LocalStore, StoreBatch};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tidesync_protocol::{ConflictRecord, OperationLog, Record};

/// Store, log and conflicts; always locked together.
#[derive(Debug)]
pub(crate) struct State {
    pub store: LocalStore,
    pub oplog: OperationLog,
    pub conflicts: BTreeMap<u64, ConflictRecord>,
}

impl State {
    /// Rebuilds the in-memory log and conflicts from the store.
    pub fn load(store: LocalStore) -> SyncResult<Self> {
        let oplog = OperationLog::restore(store.operations()?, store.next_sequence()?)?;
        let conflicts = store
            .conflicts()?
            .into_iter()
            .map(|c| (c.sequence(), c))
            .collect();
        Ok(Self {
            store,
            oplog,
            conflicts,
        })
    }

    /// Commits a batch. On failure the in-memory state is reloaded from the
    /// store, which still holds the last committed batch.
    pub fn commit(&mut self, batch: StoreBatch) -> SyncResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let Err(err) = self.store.commit(batch) else {
            return Ok(());
        };

        tracing::warn!(error = %err, "local store write failed, reloading engine state");
        if let Err(reload) = self.reload() {
            tracing::warn!(error = %reload, "reloading engine state failed");
        }
        Err(err)
    }

    fn reload(&mut self) -> SyncResult<()> {
        let in_flight: Vec<u64> = self
            .oplog
            .iter()
            .map(|op| op.sequence)
            .filter(|seq| self.oplog.is_in_flight(*seq))
            .collect();

        let mut oplog =
            OperationLog::restore(self.store.operations()?, self.store.next_sequence()?)?;
        for sequence in in_flight {
            if oplog.get_by_sequence(sequence).is_some() {
                oplog.mark_in_flight(sequence)?;
            }
        }

        self.oplog = oplog;
        self.conflicts = self
            .store
            .conflicts()?
            .into_iter()
            .map(|c| (c.sequence(), c))
            .collect();
        Ok(())
    }

    /// Stages the server's copy of a record: tombstones delete locally.
    pub fn stage_server_record(batch: &mut StoreBatch, record: &Record) -> SyncResult<()> {
        if record.deleted {
            batch.delete(&record.table, &record.id);
            Ok(())
        } else {
            batch.upsert(record)
        }
    }

    /// Drops an operation and its conflict, staging both removals.
    pub fn forget_operation(&mut self, batch: &mut StoreBatch, sequence: u64) {
        self.oplog.remove(sequence);
        batch.remove_operation(sequence);
        if self.conflicts.remove(&sequence).is_some() {
            batch.remove_conflict(sequence);
        }
    }
}

/// Cooperative cancellation flag shared with a running cycle.
///
/// Checked between remote calls; work already committed is kept.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Tracks which cycles are running.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    pushing: AtomicBool,
    pulling: Mutex<HashSet<String>>,
}

impl InFlight {
    /// Claims the single push slot.
    pub fn begin_push(&self) -> SyncResult<PushGuard<'_>> {
        self.pushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SyncError::AlreadyInProgress("a push is already running".into()))?;
        Ok(PushGuard {
            flag: &self.pushing,
        })
    }

    /// Claims the pull slot of a query.
    pub fn begin_pull(&self, query_id: &str) -> SyncResult<PullGuard<'_>> {
        if !self.pulling.lock().insert(query_id.to_string()) {
            return Err(SyncError::AlreadyInProgress(format!(
                "query {query_id:?} is already being pulled"
            )));
        }
        Ok(PullGuard {
            pulling: &self.pulling,
            query_id: query_id.to_string(),
        })
    }

    pub fn is_pushing(&self) -> bool {
        self.pushing.load(Ordering::Acquire)
    }
}

/// Releases the push slot on drop.
#[derive(Debug)]
pub(crate) struct PushGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Releases a query's pull slot on drop.
#[derive(Debug)]
pub(crate) struct PullGuard<'a> {
    pulling: &'a Mutex<HashSet<String>>,
    query_id: String,
}

impl Drop for PullGuard<'_> {
    fn drop(&mut self) {
        self.pulling.lock().remove(&self.query_id);
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Push cycles run to the end of the log.
    pub push_cycles: u64,
    /// Pull cycles that ended without error.
    pub pull_cycles: u64,
    /// Operations the server accepted.
    pub operations_pushed: u64,
    /// Server records applied locally.
    pub records_pulled: u64,
    /// Version conflicts met during push.
    pub conflicts_encountered: u64,
    /// Operations the server rejected.
    pub operations_failed: u64,
    /// Last time a push or pull finished without error.
    pub last_sync_time: Option<Instant>,
    /// Last terminal error.
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidesync_protocol::NewOperation;

    #[test]
    fn push_slot_is_exclusive() {
        let in_flight = InFlight::default();
        let guard = in_flight.begin_push().unwrap();
        assert!(in_flight.is_pushing());
        assert!(matches!(
            in_flight.begin_push(),
            Err(SyncError::AlreadyInProgress(_))
        ));

        drop(guard);
        assert!(!in_flight.is_pushing());
        assert!(in_flight.begin_push().is_ok());
    }

    #[test]
    fn pull_slots_are_per_query() {
        let in_flight = InFlight::default();
        let notes = in_flight.begin_pull("notes").unwrap();
        let _todos = in_flight.begin_pull("todos").unwrap();
        assert!(in_flight.begin_pull("notes").is_err());

        drop(notes);
        assert!(in_flight.begin_pull("notes").is_ok());
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let observer = token.clone();
        assert!(observer.check().is_ok());

        token.cancel();
        assert!(observer.is_cancelled());
        assert!(matches!(observer.check(), Err(SyncError::Cancelled)));
    }

    #[test]
    fn load_restores_log_from_store() {
        let mut store = LocalStore::in_memory();
        let mut log = OperationLog::new();
        let op = log
            .enqueue(NewOperation::insert("notes", "a1", json!({})))
            .unwrap()
            .effective()
            .cloned()
            .unwrap();

        let mut batch = StoreBatch::new();
        batch.put_operation(&op).unwrap();
        batch.set_next_sequence(log.next_sequence()).unwrap();
        batch
            .put_conflict(&ConflictRecord::new(
                op.clone(),
                Record::new("notes", "a1", json!({})).with_version("v1"),
            ))
            .unwrap();
        store.commit(batch).unwrap();

        let state = State::load(store).unwrap();
        assert_eq!(state.oplog.peek_count(), 1);
        assert_eq!(state.oplog.next_sequence(), 2);
        assert!(state.conflicts.contains_key(&op.sequence));
    }
}
