//! The sync context: one client's store, log, remote and sync cycles.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::pull::{self, PullRequest, PullResult};
use crate::push::{self, PushResult};
use crate::remote::{Credential, CredentialProvider, RemoteError, RemoteResult, RemoteService};
use crate::state::{CancelToken, InFlight, State, SyncStats};
use crate::store::{check_table_name, LocalStore, StoreBatch};
use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tidesync_protocol::{
    merge_payload, Collapse, ConflictRecord, ConflictResolver, Filter, NewOperation,
    OperationKind, PendingOperation, Record, RecordId, Resolution,
};

/// Result of a full pull-then-push cycle.
#[derive(Debug)]
pub struct SyncCycleResult {
    /// One result per pulled query, in request order.
    pub pulls: Vec<PullResult>,
    /// Push result; `None` if a pull failed and the push was skipped.
    pub push: Option<PushResult>,
    /// Duration of the cycle.
    pub duration: Duration,
}

impl SyncCycleResult {
    /// Returns true if every pull and the push ended without error.
    pub fn is_success(&self) -> bool {
        self.pulls.iter().all(PullResult::is_success)
            && self.push.as_ref().is_some_and(PushResult::is_success)
    }
}

/// Offline-first sync context.
///
/// Local mutations are applied to the store immediately and queued in the
/// operation log. [`push`](Self::push) sends them to the remote service,
/// [`pull`](Self::pull) brings server changes in. Both can run while the
/// application keeps mutating; at most one push and one pull per query run
/// at a time.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use serde_json::json;
/// use tidesync_engine::{
///     CancelToken, LocalStore, MemoryRemote, PullRequest, StaticCredentials, SyncConfig,
///     SyncContext,
/// };
/// use tidesync_protocol::ConflictPolicy;
///
/// # async fn run() -> tidesync_engine::SyncResult<()> {
/// let ctx = SyncContext::new(
///     SyncConfig::default(),
///     LocalStore::in_memory(),
///     Arc::new(MemoryRemote::new()),
///     Arc::new(StaticCredentials::new("token")),
///     ConflictPolicy::ServerWins,
/// )?;
///
/// ctx.insert("notes", "a1", json!({"text": "hello"}))?;
/// let cancel = CancelToken::new();
/// let cycle = ctx.sync(&[PullRequest::new("all-notes", "notes")], &cancel).await;
/// assert!(cycle.is_success());
/// # Ok(())
/// # }
/// ```
pub struct SyncContext<R: RemoteService> {
    pub(crate) config: SyncConfig,
    pub(crate) state: RwLock<State>,
    pub(crate) remote: Arc<R>,
    pub(crate) credentials: Arc<dyn CredentialProvider>,
    pub(crate) resolver: Box<dyn ConflictResolver>,
    pub(crate) in_flight: InFlight,
    pub(crate) stats: RwLock<SyncStats>,
}

impl<R: RemoteService> SyncContext<R> {
    /// Creates a context over an opened store.
    ///
    /// Pending operations, cursors and conflicts persisted in the store are
    /// loaded; operations that were in flight when the process stopped are
    /// retried on the next push.
    pub fn new(
        config: SyncConfig,
        store: LocalStore,
        remote: Arc<R>,
        credentials: Arc<dyn CredentialProvider>,
        resolver: impl ConflictResolver + 'static,
    ) -> SyncResult<Self> {
        config.validate()?;
        let state = State::load(store)?;
        tracing::debug!(
            pending = state.oplog.peek_count(),
            conflicts = state.conflicts.len(),
            "sync context opened"
        );
        Ok(Self {
            config,
            state: RwLock::new(state),
            remote,
            credentials,
            resolver: Box::new(resolver),
            in_flight: InFlight::default(),
            stats: RwLock::new(SyncStats::default()),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the remote service.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Applies a mutation locally and queues it for push.
    ///
    /// Returns the sequence of the operation that now carries the change
    /// (the existing one if it collapsed, the cancelled one if an unsent
    /// insert was deleted).
    pub fn enqueue(
        &self,
        table: &str,
        kind: OperationKind,
        id: impl Into<RecordId>,
        payload: Option<Value>,
    ) -> SyncResult<u64> {
        check_table_name(table)?;
        let id = id.into();
        if kind.has_payload() != payload.is_some() {
            return Err(SyncError::ValidationFailure(format!(
                "{kind:?} on {table}/{id} {} a payload",
                if kind.has_payload() { "requires" } else { "takes no" }
            )));
        }

        let mut guard = self.state.write();
        let state = &mut *guard;
        let existing = state.store.get(table, &id)?;

        let (new, local) = match (kind, existing, payload) {
            (OperationKind::Insert, Some(_), _) => {
                return Err(SyncError::ValidationFailure(format!(
                    "{table}/{id} already exists"
                )));
            }
            (OperationKind::Insert, None, Some(payload)) => (
                NewOperation::insert(table, id.clone(), payload.clone()),
                Some(Record::new(table, id.clone(), payload)),
            ),
            (OperationKind::Update, Some(mut record), Some(patch)) => {
                record.payload = merge_payload(&record.payload, &patch);
                (
                    NewOperation::update(
                        table,
                        id.clone(),
                        record.payload.clone(),
                        record.version.clone(),
                    ),
                    Some(record),
                )
            }
            (OperationKind::Delete, Some(record), None) => (
                NewOperation::delete(table, id.clone(), record.version),
                None,
            ),
            (OperationKind::Delete, None, None) => {
                // Deleting twice leaves the pending delete as it is.
                if let Some(op) = state
                    .oplog
                    .get(table, &id)
                    .filter(|op| op.kind == OperationKind::Delete)
                {
                    return Ok(op.sequence);
                }
                return Err(SyncError::ValidationFailure(format!(
                    "{table}/{id} does not exist locally"
                )));
            }
            _ => {
                return Err(SyncError::ValidationFailure(format!(
                    "{table}/{id} does not exist locally"
                )));
            }
        };

        let collapse = state.oplog.enqueue(new)?;
        let mut batch = StoreBatch::new();
        match &local {
            Some(record) => batch.upsert(record)?,
            None => batch.delete(table, &id),
        }
        match &collapse {
            Collapse::Appended(op) | Collapse::Merged(op) => batch.put_operation(op)?,
            Collapse::Cancelled(sequence) => {
                batch.remove_operation(*sequence);
                if state.conflicts.remove(sequence).is_some() {
                    batch.remove_conflict(*sequence);
                }
            }
        }
        batch.set_next_sequence(state.oplog.next_sequence())?;
        state.commit(batch)?;

        tracing::debug!(
            table,
            id = %id,
            ?kind,
            sequence = collapse.sequence(),
            collapsed = !matches!(collapse, Collapse::Appended(_)),
            "queued local mutation"
        );
        Ok(collapse.sequence())
    }

    /// Inserts a new record.
    pub fn insert(&self, table: &str, id: impl Into<RecordId>, payload: Value) -> SyncResult<u64> {
        self.enqueue(table, OperationKind::Insert, id, Some(payload))
    }

    /// Merges `patch` into an existing record.
    pub fn update(&self, table: &str, id: impl Into<RecordId>, patch: Value) -> SyncResult<u64> {
        self.enqueue(table, OperationKind::Update, id, Some(patch))
    }

    /// Deletes a record.
    pub fn delete(&self, table: &str, id: impl Into<RecordId>) -> SyncResult<u64> {
        self.enqueue(table, OperationKind::Delete, id, None)
    }

    /// Returns a local record.
    pub fn get(&self, table: &str, id: impl Into<RecordId>) -> SyncResult<Option<Record>> {
        check_table_name(table)?;
        self.state.read().store.get(table, &id.into())
    }

    /// Returns the local records of a table whose payload matches `filter`.
    pub fn query(&self, table: &str, filter: &Filter) -> SyncResult<Vec<Record>> {
        check_table_name(table)?;
        self.state
            .read()
            .store
            .query(table, |record: &Record| filter.matches(&record.payload))
            .collect()
    }

    /// Runs `f` with shared access to the local store.
    pub fn read_store<T>(&self, f: impl FnOnce(&LocalStore) -> T) -> T {
        f(&self.state.read().store)
    }

    /// Operations waiting to be pushed, in sequence order.
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.state.read().oplog.iter().cloned().collect()
    }

    /// Operations the server rejected.
    pub fn failed_operations(&self) -> Vec<PendingOperation> {
        self.state.read().oplog.failed().cloned().collect()
    }

    /// Number of operations in the log, failed ones included.
    pub fn pending_count(&self) -> usize {
        self.state.read().oplog.peek_count()
    }

    /// Conflicts waiting for [`resolve_conflict`](Self::resolve_conflict).
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.state.read().conflicts.values().cloned().collect()
    }

    /// Pushes pending operations.
    pub async fn push(&self, cancel: &CancelToken) -> PushResult {
        push::run(self, &[], cancel).await
    }

    /// Pushes only the pending operations on `tables`; operations on other
    /// tables stay queued. An empty list pushes everything.
    pub async fn push_tables<S: AsRef<str>>(
        &self,
        tables: &[S],
        cancel: &CancelToken,
    ) -> PushResult {
        let mut names = Vec::with_capacity(tables.len());
        for table in tables {
            let table = table.as_ref();
            if let Err(err) = check_table_name(table) {
                return PushResult {
                    error: Some(err),
                    ..PushResult::default()
                };
            }
            names.push(table.to_string());
        }
        push::run(self, &names, cancel).await
    }

    /// Pulls one query.
    pub async fn pull(&self, request: &PullRequest, cancel: &CancelToken) -> PullResult {
        pull::run(self, request, cancel).await
    }

    /// Pulls every query, then pushes.
    ///
    /// The push is skipped if a pull fails.
    pub async fn sync(&self, queries: &[PullRequest], cancel: &CancelToken) -> SyncCycleResult {
        let start = Instant::now();
        let mut pulls = Vec::with_capacity(queries.len());

        for request in queries {
            let result = self.pull(request, cancel).await;
            let failed = !result.is_success();
            pulls.push(result);
            if failed {
                return SyncCycleResult {
                    pulls,
                    push: None,
                    duration: start.elapsed(),
                };
            }
        }

        let push = self.push(cancel).await;
        SyncCycleResult {
            pulls,
            push: Some(push),
            duration: start.elapsed(),
        }
    }

    /// Settles a conflict left for the application.
    ///
    /// `ClientWins` re-arms the operation against the server's version;
    /// `ServerWins` drops it and applies the server's record.
    pub fn resolve_conflict(&self, sequence: u64, resolution: Resolution) -> SyncResult<()> {
        let _push = self.in_flight.begin_push()?;
        let mut guard = self.state.write();
        let state = &mut *guard;

        let conflict = state.conflicts.get(&sequence).cloned().ok_or_else(|| {
            SyncError::ValidationFailure(format!("no conflict for sequence {sequence}"))
        })?;

        let mut batch = StoreBatch::new();
        match resolution {
            Resolution::Unresolved => {
                return Err(SyncError::ValidationFailure(
                    "a conflict must be resolved for the client or the server".into(),
                ));
            }
            Resolution::ClientWins => {
                let op = state
                    .oplog
                    .rebase(sequence, conflict.server.version.clone())?
                    .clone();
                batch.put_operation(&op)?;
                state.conflicts.remove(&sequence);
                batch.remove_conflict(sequence);
            }
            Resolution::ServerWins => {
                state.forget_operation(&mut batch, sequence);
                State::stage_server_record(&mut batch, &conflict.server)?;
            }
        }
        state.commit(batch)?;

        tracing::info!(sequence, ?resolution, "conflict resolved");
        Ok(())
    }

    /// Drops an operation (typically a failed one) without pushing it.
    ///
    /// The local record keeps its current content.
    pub fn discard_operation(&self, sequence: u64) -> SyncResult<PendingOperation> {
        let _push = self.in_flight.begin_push()?;
        let mut guard = self.state.write();
        let state = &mut *guard;

        let op = state.oplog.get_by_sequence(sequence).cloned().ok_or_else(|| {
            SyncError::ValidationFailure(format!("no pending operation with sequence {sequence}"))
        })?;
        let mut batch = StoreBatch::new();
        state.forget_operation(&mut batch, sequence);
        state.commit(batch)?;

        tracing::info!(sequence, table = %op.table, id = %op.id, "operation discarded");
        Ok(op)
    }

    /// Drops pending operations, optionally limited to a table or a record.
    ///
    /// Local records are left as they are. Returns how many were dropped.
    pub fn purge_pending_operations(
        &self,
        table: Option<&str>,
        id: Option<&RecordId>,
    ) -> SyncResult<usize> {
        if let Some(table) = table {
            check_table_name(table)?;
        }
        let _push = self.in_flight.begin_push()?;
        let mut guard = self.state.write();
        let state = &mut *guard;

        let purged = state.oplog.purge(table, id);
        let mut batch = StoreBatch::new();
        for op in &purged {
            batch.remove_operation(op.sequence);
            if state.conflicts.remove(&op.sequence).is_some() {
                batch.remove_conflict(op.sequence);
            }
        }
        state.commit(batch)?;

        tracing::info!(count = purged.len(), "pending operations purged");
        Ok(purged.len())
    }

    /// Removes a query's local records and its cursor.
    ///
    /// Refused while operations on `table` are pending, unless `force` is
    /// set, in which case those operations are dropped too. Returns the
    /// number of records removed.
    pub fn purge_query(&self, query_id: &str, table: &str, force: bool) -> SyncResult<usize> {
        check_table_name(table)?;
        let _push = self.in_flight.begin_push()?;
        let _pull = self.in_flight.begin_pull(query_id)?;
        let mut guard = self.state.write();
        let state = &mut *guard;

        if state.oplog.has_table(table) && !force {
            return Err(SyncError::ValidationFailure(format!(
                "table {table:?} has pending operations"
            )));
        }

        let mut batch = StoreBatch::new();
        for op in state.oplog.purge(Some(table), None) {
            batch.remove_operation(op.sequence);
            if state.conflicts.remove(&op.sequence).is_some() {
                batch.remove_conflict(op.sequence);
            }
        }
        let removed = state.store.count(table);
        batch.clear_table(table);
        batch.remove_cursor(query_id);
        state.commit(batch)?;

        tracing::info!(query_id, table, removed, force, "query purged");
        Ok(removed)
    }

    /// Folds the local store's log into a single frame.
    ///
    /// The store also compacts on its own as its log grows; this forces it,
    /// for example before the application is suspended.
    pub fn compact_store(&self) -> SyncResult<()> {
        self.state.write().store.compact()
    }

    /// Forgets a query's progress so the next pull starts from scratch.
    pub fn reset_cursor(&self, query_id: &str) -> SyncResult<()> {
        let _pull = self.in_flight.begin_pull(query_id)?;
        let mut batch = StoreBatch::new();
        batch.remove_cursor(query_id);
        self.state.write().commit(batch)
    }

    pub(crate) fn credential(&self) -> SyncResult<Credential> {
        self.credentials
            .current_token()
            .map_err(|err| SyncError::Unauthenticated(err.0))
    }

    pub(crate) async fn with_timeout<T>(
        &self,
        call: impl Future<Output = RemoteResult<T>>,
    ) -> RemoteResult<T> {
        let limit = self.config.request_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Network(format!(
                "request timed out after {limit:?}"
            ))),
        }
    }

    pub(crate) fn record_push(&self, result: &PushResult) {
        let mut stats = self.stats.write();
        stats.operations_pushed += result.pushed_count as u64;
        stats.conflicts_encountered += result.conflicts.len() as u64;
        stats.operations_failed += result.failed.len() as u64;
        match &result.error {
            None => {
                stats.push_cycles += 1;
                stats.last_sync_time = Some(Instant::now());
            }
            Some(err) => stats.last_error = Some(err.to_string()),
        }
    }

    pub(crate) fn record_pull(&self, result: &PullResult) {
        let mut stats = self.stats.write();
        stats.records_pulled += result.applied_count as u64;
        match &result.error {
            None => {
                stats.pull_cycles += 1;
                stats.last_sync_time = Some(Instant::now());
            }
            Some(err) => stats.last_error = Some(err.to_string()),
        }
    }
}

impl<R: RemoteService> std::fmt::Debug for SyncContext<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .field("pending", &state.oplog.peek_count())
            .field("conflicts", &state.conflicts.len())
            .field("pushing", &self.in_flight.is_pushing())
            .finish_non_exhaustive()
    }
}
