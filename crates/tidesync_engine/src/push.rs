//! Push engine: drains the operation log against the remote service.
//!
//! Operations are sent one at a time in sequence order, optionally limited
//! to a set of tables. Failed operations are skipped. A transient error or a missing credential stops the cycle and
//! leaves the current operation at the head of the log; everything already
//! acknowledged stays committed.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::remote::{Credential, RemoteError, RemoteResult, RemoteService};
use crate::state::{CancelToken, State};
use crate::store::StoreBatch;
use serde_json::Value;
use tidesync_protocol::{
    Completion, ConflictRecord, OperationKind, PendingOperation, Record, Resolution,
};

/// Summary of a push cycle.
#[derive(Debug, Default)]
pub struct PushResult {
    /// Operations the server accepted.
    pub pushed_count: usize,
    /// Conflicts met, with the resolution applied to each.
    pub conflicts: Vec<ConflictRecord>,
    /// Sequences of operations the server rejected during this cycle.
    pub failed: Vec<u64>,
    /// Error that ended the cycle early, if any.
    pub error: Option<SyncError>,
}

impl PushResult {
    /// Returns true if the cycle reached the end of the log.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Conflicts still waiting for the application.
    pub fn unresolved(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }
}

enum Outcome {
    Pushed,
    Resolved { conflict: ConflictRecord, pushed: bool },
    Parked(ConflictRecord),
    Failed(u64),
    Skipped,
}

pub(crate) async fn run<R: RemoteService>(
    ctx: &SyncContext<R>,
    tables: &[String],
    cancel: &CancelToken,
) -> PushResult {
    let mut result = PushResult::default();
    let _guard = match ctx.in_flight.begin_push() {
        Ok(guard) => guard,
        Err(err) => {
            result.error = Some(err);
            return result;
        }
    };

    if let Err(err) = drain(ctx, tables, cancel, &mut result).await {
        tracing::warn!(error = %err, pushed = result.pushed_count, "push stopped");
        result.error = Some(err);
    }

    tracing::info!(
        pushed = result.pushed_count,
        conflicts = result.conflicts.len(),
        failed = result.failed.len(),
        "push cycle finished"
    );
    ctx.record_push(&result);
    result
}

async fn drain<R: RemoteService>(
    ctx: &SyncContext<R>,
    tables: &[String],
    cancel: &CancelToken,
    result: &mut PushResult,
) -> SyncResult<()> {
    // Operations retained after a mid-flight collapse keep their sequence and
    // are picked up by the next cycle.
    let mut after = 0;
    loop {
        let batch = ctx
            .state
            .read()
            .oplog
            .next_batch_in(tables, after, ctx.config.push_batch_size);
        if batch.is_empty() {
            return Ok(());
        }

        for op in batch {
            after = op.sequence;
            cancel.check()?;
            match push_one(ctx, op.sequence).await? {
                Outcome::Pushed => result.pushed_count += 1,
                Outcome::Resolved { conflict, pushed } => {
                    if pushed {
                        result.pushed_count += 1;
                    }
                    result.conflicts.push(conflict);
                }
                Outcome::Parked(conflict) => result.conflicts.push(conflict),
                Outcome::Failed(sequence) => result.failed.push(sequence),
                Outcome::Skipped => {}
            }
        }
    }
}

async fn push_one<R: RemoteService>(ctx: &SyncContext<R>, sequence: u64) -> SyncResult<Outcome> {
    let credential = ctx.credential()?;

    let op = {
        let mut state = ctx.state.write();
        match state.oplog.get_by_sequence(sequence) {
            Some(op) if !op.is_failed() => {}
            _ => return Ok(Outcome::Skipped),
        }
        state.oplog.mark_in_flight(sequence)?.clone()
    };

    tracing::debug!(
        sequence,
        table = %op.table,
        id = %op.id,
        kind = ?op.kind,
        "pushing operation"
    );

    let outcome = match send(ctx, &credential, &op).await {
        Ok(record) => complete(ctx, &op, record),
        Err(RemoteError::NotFound) if op.kind == OperationKind::Delete => complete(ctx, &op, None),
        Err(RemoteError::Conflict { current }) => on_conflict(ctx, &credential, op, *current).await,
        Err(err) => reject(ctx, &op, err),
    };
    if outcome.is_err() {
        ctx.state.write().oplog.clear_in_flight(sequence);
    }
    outcome
}

async fn send<R: RemoteService>(
    ctx: &SyncContext<R>,
    credential: &Credential,
    op: &PendingOperation,
) -> RemoteResult<Option<Record>> {
    let null = Value::Null;
    let payload = op.payload.as_ref().unwrap_or(&null);
    let expected = op.expected_version.as_ref();

    match op.kind {
        OperationKind::Insert => ctx
            .with_timeout(ctx.remote.create(credential, &op.table, &op.id, payload))
            .await
            .map(Some),
        OperationKind::Update => ctx
            .with_timeout(ctx.remote.replace(credential, &op.table, &op.id, payload, expected))
            .await
            .map(Some),
        OperationKind::Delete => ctx
            .with_timeout(ctx.remote.delete(credential, &op.table, &op.id, expected))
            .await
            .map(|()| None),
    }
}

/// True if the server already holds what `op` would write, e.g. after a
/// crash between the remote write and removing the operation.
fn already_applied(op: &PendingOperation, server: &Record) -> bool {
    match op.kind {
        OperationKind::Delete => server.deleted,
        OperationKind::Insert | OperationKind::Update => {
            !server.deleted && op.payload.as_ref() == Some(&server.payload)
        }
    }
}

async fn on_conflict<R: RemoteService>(
    ctx: &SyncContext<R>,
    credential: &Credential,
    op: PendingOperation,
    server: Record,
) -> SyncResult<Outcome> {
    if already_applied(&op, &server) {
        tracing::debug!(sequence = op.sequence, "server already holds the change");
        return complete(ctx, &op, Some(server));
    }

    let resolution = ctx.resolver.resolve(&op, &server);
    tracing::warn!(
        sequence = op.sequence,
        table = %op.table,
        id = %op.id,
        ?resolution,
        "version conflict"
    );

    match resolution {
        Resolution::Unresolved => park(ctx, op, server),
        Resolution::ServerWins => {
            server_wins(ctx, &op, &server)?;
            Ok(Outcome::Resolved {
                conflict: ConflictRecord {
                    operation: op,
                    server,
                    resolution,
                },
                pushed: false,
            })
        }
        Resolution::ClientWins => {
            let mut retry = op.clone();
            retry.expected_version = server.version.clone();
            if retry.kind == OperationKind::Insert {
                retry.kind = OperationKind::Update;
            }

            let sent = match send(ctx, credential, &retry).await {
                Ok(record) => record,
                Err(RemoteError::NotFound) if retry.kind == OperationKind::Delete => None,
                Err(RemoteError::Conflict { current }) => return park(ctx, op, *current),
                Err(err) => return reject(ctx, &op, err),
            };

            complete(ctx, &op, sent)?;
            Ok(Outcome::Resolved {
                conflict: ConflictRecord {
                    operation: op,
                    server,
                    resolution,
                },
                pushed: true,
            })
        }
    }
}

/// Gives the record to the server, unless the application changed it again
/// while the losing write was in flight: that newer change is kept and
/// rebased onto the server's version for the next cycle.
fn server_wins<R: RemoteService>(
    ctx: &SyncContext<R>,
    op: &PendingOperation,
    server: &Record,
) -> SyncResult<()> {
    let mut guard = ctx.state.write();
    let state = &mut *guard;
    let mut batch = StoreBatch::new();

    let edited = state
        .oplog
        .get_by_sequence(op.sequence)
        .is_some_and(|current| current.revision != op.revision);
    if edited {
        tracing::debug!(sequence = op.sequence, "operation changed in flight, rebased");
        let rebased = state
            .oplog
            .rebase(op.sequence, server.version.clone())?
            .clone();
        state.oplog.clear_in_flight(op.sequence);
        batch.put_operation(&rebased)?;
        if let Some(mut local) = state.store.get(&op.table, &op.id)? {
            local.version = server.version.clone();
            local.updated_at = server.updated_at;
            batch.upsert(&local)?;
        }
    } else {
        state.forget_operation(&mut batch, op.sequence);
        State::stage_server_record(&mut batch, server)?;
    }
    state.commit(batch)
}

/// Settles an operation the server accepted.
fn complete<R: RemoteService>(
    ctx: &SyncContext<R>,
    op: &PendingOperation,
    server: Option<Record>,
) -> SyncResult<Outcome> {
    let mut guard = ctx.state.write();
    let state = &mut *guard;
    let version = server.as_ref().and_then(|r| r.version.clone());
    let mut batch = StoreBatch::new();

    match state.oplog.complete(op.sequence, op.revision, version)? {
        Completion::Removed(_) => {
            batch.remove_operation(op.sequence);
            if state.conflicts.remove(&op.sequence).is_some() {
                batch.remove_conflict(op.sequence);
            }
            match &server {
                Some(record) => State::stage_server_record(&mut batch, record)?,
                None => batch.delete(&op.table, &op.id),
            }
        }
        Completion::Retained(pending) => {
            // Collapsed while in flight: keep the newer local payload, only
            // adopt the server's version so the follow-up write applies.
            tracing::debug!(sequence = op.sequence, "operation changed in flight, retained");
            batch.put_operation(&pending)?;
            if let Some(server) = &server {
                if let Some(mut local) = state.store.get(&op.table, &op.id)? {
                    local.version = server.version.clone();
                    local.updated_at = server.updated_at;
                    batch.upsert(&local)?;
                }
            }
        }
    }

    state.commit(batch)?;
    Ok(Outcome::Pushed)
}

/// Keeps the operation and persists an unresolved conflict.
fn park<R: RemoteService>(
    ctx: &SyncContext<R>,
    op: PendingOperation,
    server: Record,
) -> SyncResult<Outcome> {
    let mut guard = ctx.state.write();
    let state = &mut *guard;
    state.oplog.clear_in_flight(op.sequence);

    let conflict = ConflictRecord::new(op, server);
    let mut batch = StoreBatch::new();
    batch.put_conflict(&conflict)?;
    state.conflicts.insert(conflict.sequence(), conflict.clone());
    state.commit(batch)?;
    Ok(Outcome::Parked(conflict))
}

/// Handles a non-conflict remote error: payload rejections mark the
/// operation Failed, everything else ends the cycle.
fn reject<R: RemoteService>(
    ctx: &SyncContext<R>,
    op: &PendingOperation,
    err: RemoteError,
) -> SyncResult<Outcome> {
    let reason = match err {
        RemoteError::Validation(reason) => reason,
        RemoteError::NotFound => "record no longer exists on the server".to_string(),
        RemoteError::Server { status, message } if status < 500 => format!("{status}: {message}"),
        other => return Err(other.into()),
    };

    tracing::warn!(sequence = op.sequence, %reason, "operation rejected by server");
    let mut state = ctx.state.write();
    let failed = state.oplog.mark_failed(op.sequence, reason)?.clone();
    let mut batch = StoreBatch::new();
    batch.put_operation(&failed)?;
    state.commit(batch)?;
    Ok(Outcome::Failed(op.sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tidesync_protocol::NewOperation;

    fn op(kind: OperationKind, payload: Option<Value>) -> PendingOperation {
        let new = match kind {
            OperationKind::Insert => NewOperation::insert("notes", "a1", payload.unwrap_or_default()),
            OperationKind::Update => {
                NewOperation::update("notes", "a1", payload.unwrap_or_default(), None)
            }
            OperationKind::Delete => NewOperation::delete("notes", "a1", None),
        };
        let mut log = tidesync_protocol::OperationLog::new();
        log.enqueue(new).unwrap().effective().cloned().unwrap()
    }

    #[test]
    fn already_applied_compares_payload() {
        let server = Record::new("notes", "a1", json!({"t": 1})).with_version("v3");
        assert!(already_applied(&op(OperationKind::Update, Some(json!({"t": 1}))), &server));
        assert!(!already_applied(&op(OperationKind::Update, Some(json!({"t": 2}))), &server));
        assert!(already_applied(&op(OperationKind::Insert, Some(json!({"t": 1}))), &server));
        assert!(!already_applied(&op(OperationKind::Delete, None), &server));
        assert!(already_applied(&op(OperationKind::Delete, None), &server.clone().tombstone()));
    }
}
