//! Collapsing log of pending local mutations.

use crate::error::{ProtocolError, ProtocolResult};
use crate::operation::{NewOperation, OperationKind, OperationState, PendingOperation};
use crate::record::{merge_payload, RecordId, Version};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Outcome of [`OperationLog::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum Collapse {
    /// No operation was pending for the record; a new one was appended.
    Appended(PendingOperation),
    /// The mutation was folded into the pending operation.
    Merged(PendingOperation),
    /// The mutation cancelled the pending operation; nothing is left to push.
    Cancelled(u64),
}

impl Collapse {
    /// Returns the operation left in the log, if any.
    pub fn effective(&self) -> Option<&PendingOperation> {
        match self {
            Collapse::Appended(op) | Collapse::Merged(op) => Some(op),
            Collapse::Cancelled(_) => None,
        }
    }

    /// Returns the sequence number the mutation landed on.
    pub fn sequence(&self) -> u64 {
        match self {
            Collapse::Appended(op) | Collapse::Merged(op) => op.sequence,
            Collapse::Cancelled(sequence) => *sequence,
        }
    }
}

/// Outcome of [`OperationLog::complete`].
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The operation was pushed as-is and left the log.
    Removed(PendingOperation),
    /// The operation changed while its remote call was in flight and must be
    /// pushed again, now against the version the server returned.
    Retained(PendingOperation),
}

/// Ordered log of pending operations with at most one entry per record.
///
/// # Invariants
///
/// - At most one operation per `(table, id)`
/// - Iteration follows ascending sequence, i.e. the enqueue order of the
///   surviving operation
/// - Sequence numbers are never handed out twice
#[derive(Debug, Clone)]
pub struct OperationLog {
    ops: BTreeMap<u64, PendingOperation>,
    index: HashMap<(String, RecordId), u64>,
    in_flight: BTreeSet<u64>,
    next_sequence: u64,
}

impl OperationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self {
            ops: BTreeMap::new(),
            index: HashMap::new(),
            in_flight: BTreeSet::new(),
            next_sequence: 1,
        }
    }

    /// Rebuilds a log from persisted operations.
    ///
    /// `next_sequence` is the persisted counter; the log never hands out a
    /// sequence at or below one it has already seen.
    pub fn restore(
        ops: impl IntoIterator<Item = PendingOperation>,
        next_sequence: u64,
    ) -> ProtocolResult<Self> {
        let mut log = Self::new();
        log.next_sequence = next_sequence.max(1);

        for mut op in ops {
            let key = (op.table.clone(), op.id.clone());
            if let Some(existing) = log.index.get(&key) {
                return Err(ProtocolError::InvalidOperation(format!(
                    "operations {existing} and {} both target {}/{}",
                    op.sequence, op.table, op.id
                )));
            }
            // Nothing is in flight after a restart.
            if op.state == OperationState::Attempted {
                op.state = OperationState::Pending;
            }
            log.next_sequence = log.next_sequence.max(op.sequence + 1);
            log.index.insert(key, op.sequence);
            log.ops.insert(op.sequence, op);
        }

        Ok(log)
    }

    /// Records a mutation, collapsing it into the pending operation for the
    /// same record when there is one.
    ///
    /// | pending \ new | Insert | Update | Delete |
    /// |---|---|---|---|
    /// | Insert | rejected | Insert, merged payload | cancelled (Delete if in flight) |
    /// | Update | rejected | Update, latest payload | Delete |
    /// | Delete | rejected | rejected | unchanged |
    pub fn enqueue(&mut self, new: NewOperation) -> ProtocolResult<Collapse> {
        new.validate()?;

        let key = (new.table.clone(), new.id.clone());
        let Some(&sequence) = self.index.get(&key) else {
            let sequence = self.next_sequence;
            self.next_sequence += 1;
            let op = PendingOperation::from_new(sequence, new);
            self.index.insert(key, sequence);
            self.ops.insert(sequence, op.clone());
            return Ok(Collapse::Appended(op));
        };

        let in_flight = self.in_flight.contains(&sequence);
        let existing = self
            .ops
            .get_mut(&sequence)
            .ok_or(ProtocolError::UnknownSequence(sequence))?;

        match (existing.kind, new.kind) {
            (_, OperationKind::Insert) | (OperationKind::Delete, OperationKind::Update) => {
                return Err(ProtocolError::InvalidCollapse {
                    table: new.table,
                    id: new.id,
                    pending: existing.kind,
                    new: new.kind,
                });
            }
            (OperationKind::Delete, OperationKind::Delete) => {
                return Ok(Collapse::Merged(existing.clone()));
            }
            (OperationKind::Insert, OperationKind::Delete) if !in_flight => {
                self.ops.remove(&sequence);
                self.index.remove(&key);
                return Ok(Collapse::Cancelled(sequence));
            }
            (OperationKind::Insert, OperationKind::Update) => {
                existing.payload = match (&existing.payload, &new.payload) {
                    (Some(base), Some(patch)) => Some(merge_payload(base, patch)),
                    (_, patch) => patch.clone(),
                };
            }
            (OperationKind::Update, OperationKind::Update) => {
                existing.payload = new.payload;
            }
            (_, OperationKind::Delete) => {
                existing.kind = OperationKind::Delete;
                existing.payload = None;
            }
        }

        existing.revision += 1;
        if existing.is_failed() {
            existing.state = OperationState::Pending;
        }
        Ok(Collapse::Merged(existing.clone()))
    }

    /// Returns up to `max` pushable operations in sequence order.
    ///
    /// Failed operations are excluded.
    pub fn next_batch(&self, max: usize) -> Vec<PendingOperation> {
        self.next_batch_in(&[] as &[&str], 0, max)
    }

    /// Like [`next_batch`](Self::next_batch), starting after `sequence`.
    pub fn next_batch_after(&self, sequence: u64, max: usize) -> Vec<PendingOperation> {
        self.next_batch_in(&[] as &[&str], sequence, max)
    }

    /// Like [`next_batch_after`](Self::next_batch_after), limited to
    /// operations on `tables`. An empty list selects every table.
    pub fn next_batch_in<S: AsRef<str>>(
        &self,
        tables: &[S],
        sequence: u64,
        max: usize,
    ) -> Vec<PendingOperation> {
        self.eligible(sequence.saturating_add(1), max, |op| {
            tables.is_empty() || tables.iter().any(|t| t.as_ref() == op.table)
        })
    }

    fn eligible(
        &self,
        from: u64,
        max: usize,
        selected: impl Fn(&PendingOperation) -> bool,
    ) -> Vec<PendingOperation> {
        self.ops
            .range(from..)
            .map(|(_, op)| op)
            .filter(|op| !op.is_failed() && selected(op))
            .take(max)
            .cloned()
            .collect()
    }

    /// Removes an operation.
    pub fn remove(&mut self, sequence: u64) -> Option<PendingOperation> {
        let op = self.ops.remove(&sequence)?;
        self.index.remove(&(op.table.clone(), op.id.clone()));
        self.in_flight.remove(&sequence);
        Some(op)
    }

    /// Number of operations in the log, failed ones included.
    pub fn peek_count(&self) -> usize {
        self.ops.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the pending operation for a record.
    pub fn get(&self, table: &str, id: &RecordId) -> Option<&PendingOperation> {
        let sequence = self.index.get(&(table.to_string(), id.clone()))?;
        self.ops.get(sequence)
    }

    /// Returns the operation with the given sequence.
    pub fn get_by_sequence(&self, sequence: u64) -> Option<&PendingOperation> {
        self.ops.get(&sequence)
    }

    /// Returns true if any operation targets the table.
    pub fn has_table(&self, table: &str) -> bool {
        self.ops.values().any(|op| op.table == table)
    }

    /// Iterates over all operations in sequence order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOperation> {
        self.ops.values()
    }

    /// Iterates over operations the server rejected.
    pub fn failed(&self) -> impl Iterator<Item = &PendingOperation> {
        self.ops.values().filter(|op| op.is_failed())
    }

    /// The sequence the next appended operation will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Marks an operation as having a remote call in flight.
    pub fn mark_in_flight(&mut self, sequence: u64) -> ProtocolResult<&PendingOperation> {
        let op = self
            .ops
            .get_mut(&sequence)
            .ok_or(ProtocolError::UnknownSequence(sequence))?;
        op.state = OperationState::Attempted;
        self.in_flight.insert(sequence);
        Ok(op)
    }

    /// Clears the in-flight mark, leaving the operation retryable.
    pub fn clear_in_flight(&mut self, sequence: u64) {
        if !self.in_flight.remove(&sequence) {
            return;
        }
        if let Some(op) = self.ops.get_mut(&sequence) {
            if op.state == OperationState::Attempted {
                op.state = OperationState::Pending;
            }
        }
    }

    /// Returns true if the operation has a remote call in flight.
    pub fn is_in_flight(&self, sequence: u64) -> bool {
        self.in_flight.contains(&sequence)
    }

    /// Marks an operation as rejected by the server.
    pub fn mark_failed(
        &mut self,
        sequence: u64,
        reason: impl Into<String>,
    ) -> ProtocolResult<&PendingOperation> {
        self.in_flight.remove(&sequence);
        let op = self
            .ops
            .get_mut(&sequence)
            .ok_or(ProtocolError::UnknownSequence(sequence))?;
        op.state = OperationState::Failed {
            reason: reason.into(),
        };
        Ok(op)
    }

    /// Finishes an operation whose remote write succeeded.
    ///
    /// `revision` is the revision that was sent. If the operation collapsed
    /// with a later mutation in the meantime it is retained, rebased onto
    /// `version`; otherwise it is removed.
    pub fn complete(
        &mut self,
        sequence: u64,
        revision: u64,
        version: Option<Version>,
    ) -> ProtocolResult<Completion> {
        self.in_flight.remove(&sequence);
        let op = self
            .ops
            .get_mut(&sequence)
            .ok_or(ProtocolError::UnknownSequence(sequence))?;

        if op.revision == revision {
            let removed = op.clone();
            self.remove(sequence);
            return Ok(Completion::Removed(removed));
        }

        op.expected_version = version;
        if op.kind == OperationKind::Insert {
            op.kind = OperationKind::Update;
        }
        op.state = OperationState::Pending;
        Ok(Completion::Retained(op.clone()))
    }

    /// Re-arms an operation against the server's current version.
    ///
    /// The record exists remotely, so an Insert becomes an Update.
    pub fn rebase(
        &mut self,
        sequence: u64,
        server_version: Option<Version>,
    ) -> ProtocolResult<&PendingOperation> {
        let op = self
            .ops
            .get_mut(&sequence)
            .ok_or(ProtocolError::UnknownSequence(sequence))?;
        op.expected_version = server_version;
        if op.kind == OperationKind::Insert {
            op.kind = OperationKind::Update;
        }
        op.state = OperationState::Pending;
        op.revision += 1;
        Ok(op)
    }

    /// Removes every operation matching the filters and returns them.
    ///
    /// `None` matches everything.
    pub fn purge(&mut self, table: Option<&str>, id: Option<&RecordId>) -> Vec<PendingOperation> {
        let doomed: Vec<u64> = self
            .ops
            .values()
            .filter(|op| table.map_or(true, |t| op.table == t))
            .filter(|op| id.map_or(true, |id| &op.id == id))
            .map(|op| op.sequence)
            .collect();

        doomed
            .into_iter()
            .filter_map(|sequence| self.remove(sequence))
            .collect()
    }
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn v(token: &str) -> Option<Version> {
        Some(Version::new(token))
    }

    #[test]
    fn sequences_are_monotonic() {
        let mut log = OperationLog::new();
        let a = log.enqueue(NewOperation::insert("t", "a", json!({}))).unwrap();
        let b = log.enqueue(NewOperation::insert("t", "b", json!({}))).unwrap();
        let c = log.enqueue(NewOperation::delete("t", "c", v("v1"))).unwrap();

        assert_eq!((a.sequence(), b.sequence(), c.sequence()), (1, 2, 3));
        assert_eq!(log.next_sequence(), 4);
    }

    #[test]
    fn insert_then_update_merges_into_insert() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("notes", "a1", json!({"text": "hi", "n": 1})))
            .unwrap();
        let collapse = log
            .enqueue(NewOperation::update("notes", "a1", json!({"n": 2}), None))
            .unwrap();

        let op = collapse.effective().unwrap();
        assert_eq!(op.sequence, 1);
        assert_eq!(op.kind, OperationKind::Insert);
        assert_eq!(op.payload, Some(json!({"text": "hi", "n": 2})));
        assert_eq!(op.revision, 1);
        assert_eq!(log.peek_count(), 1);
    }

    #[test]
    fn insert_then_delete_cancels() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("notes", "a1", json!({}))).unwrap();
        let collapse = log.enqueue(NewOperation::delete("notes", "a1", None)).unwrap();

        assert_eq!(collapse, Collapse::Cancelled(1));
        assert!(log.is_empty());
        assert!(log.get("notes", &"a1".into()).is_none());
    }

    #[test]
    fn delete_of_in_flight_insert_is_kept() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("notes", "a1", json!({}))).unwrap();
        log.mark_in_flight(1).unwrap();

        let collapse = log.enqueue(NewOperation::delete("notes", "a1", None)).unwrap();
        let op = collapse.effective().unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(op.payload, None);

        // The insert lands; the delete must follow against the new version.
        match log.complete(1, 0, v("v1")).unwrap() {
            Completion::Retained(op) => {
                assert_eq!(op.kind, OperationKind::Delete);
                assert_eq!(op.expected_version, v("v1"));
            }
            other => panic!("expected retained operation, got {other:?}"),
        }
    }

    #[test]
    fn update_then_update_keeps_original_version() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::update("t", 1i64, json!({"a": 1}), v("v4")))
            .unwrap();
        let op = log
            .enqueue(NewOperation::update("t", 1i64, json!({"a": 2}), v("ignored")))
            .unwrap()
            .effective()
            .cloned()
            .unwrap();

        assert_eq!(op.payload, Some(json!({"a": 2})));
        assert_eq!(op.expected_version, v("v4"));
    }

    #[test]
    fn update_then_delete_becomes_delete() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::update("t", "x", json!({"a": 1}), v("v2")))
            .unwrap();
        let op = log
            .enqueue(NewOperation::delete("t", "x", v("v2")))
            .unwrap()
            .effective()
            .cloned()
            .unwrap();

        assert_eq!(op.sequence, 1);
        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(op.expected_version, v("v2"));
    }

    #[test]
    fn delete_absorbs_later_writes() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::delete("t", "x", v("v2"))).unwrap();

        assert!(matches!(
            log.enqueue(NewOperation::update("t", "x", json!({}), None)),
            Err(ProtocolError::InvalidCollapse { .. })
        ));
        assert!(matches!(
            log.enqueue(NewOperation::insert("t", "x", json!({}))),
            Err(ProtocolError::InvalidCollapse { .. })
        ));

        let again = log.enqueue(NewOperation::delete("t", "x", None)).unwrap();
        assert_eq!(again.effective().unwrap().revision, 0);
    }

    #[test]
    fn collapse_resets_failed_operation() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::update("t", "x", json!({"a": 1}), v("v1")))
            .unwrap();
        log.mark_failed(1, "rejected").unwrap();
        assert!(log.next_batch(10).is_empty());
        assert_eq!(log.failed().count(), 1);

        log.enqueue(NewOperation::update("t", "x", json!({"a": 2}), None))
            .unwrap();
        assert_eq!(log.next_batch(10).len(), 1);
    }

    #[test]
    fn complete_removes_unchanged_operation() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("t", "x", json!({}))).unwrap();
        log.mark_in_flight(1).unwrap();

        assert!(matches!(
            log.complete(1, 0, v("v1")).unwrap(),
            Completion::Removed(_)
        ));
        assert!(log.is_empty());
        assert!(!log.is_in_flight(1));
    }

    #[test]
    fn complete_retains_operation_changed_in_flight() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("t", "x", json!({"a": 1}))).unwrap();
        log.mark_in_flight(1).unwrap();
        log.enqueue(NewOperation::update("t", "x", json!({"a": 2}), None))
            .unwrap();

        match log.complete(1, 0, v("v1")).unwrap() {
            Completion::Retained(op) => {
                assert_eq!(op.kind, OperationKind::Update);
                assert_eq!(op.expected_version, v("v1"));
                assert_eq!(op.payload, Some(json!({"a": 2})));
                assert_eq!(op.state, OperationState::Pending);
            }
            other => panic!("expected retained operation, got {other:?}"),
        }
    }

    #[test]
    fn batches_skip_failed_and_respect_cursor() {
        let mut log = OperationLog::new();
        for id in ["a", "b", "c", "d"] {
            log.enqueue(NewOperation::insert("t", id, json!({}))).unwrap();
        }
        log.mark_failed(2, "bad").unwrap();

        let seqs = |ops: Vec<PendingOperation>| ops.iter().map(|op| op.sequence).collect::<Vec<_>>();
        assert_eq!(seqs(log.next_batch(2)), vec![1, 3]);
        assert_eq!(seqs(log.next_batch_after(1, 10)), vec![3, 4]);
        assert_eq!(seqs(log.next_batch_after(4, 10)), Vec::<u64>::new());
    }

    #[test]
    fn batches_can_be_limited_to_tables() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("notes", "a", json!({}))).unwrap();
        log.enqueue(NewOperation::insert("todos", "b", json!({}))).unwrap();
        log.enqueue(NewOperation::insert("tags", "c", json!({}))).unwrap();
        log.enqueue(NewOperation::insert("notes", "d", json!({}))).unwrap();

        let seqs = |ops: Vec<PendingOperation>| ops.iter().map(|op| op.sequence).collect::<Vec<_>>();
        assert_eq!(seqs(log.next_batch_in(&["notes"], 0, 10)), vec![1, 4]);
        assert_eq!(seqs(log.next_batch_in(&["notes", "tags"], 1, 10)), vec![3, 4]);
        assert_eq!(seqs(log.next_batch_in(&["notes"], 0, 1)), vec![1]);
        assert_eq!(seqs(log.next_batch_in(&[] as &[&str], 0, 10)), vec![1, 2, 3, 4]);
        assert!(log.next_batch_in(&["missing"], 0, 10).is_empty());
    }

    #[test]
    fn rebase_turns_insert_into_update() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("t", "x", json!({}))).unwrap();
        let op = log.rebase(1, v("v7")).unwrap();

        assert_eq!(op.kind, OperationKind::Update);
        assert_eq!(op.expected_version, v("v7"));
    }

    #[test]
    fn purge_by_table_and_id() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("a", "1", json!({}))).unwrap();
        log.enqueue(NewOperation::insert("a", "2", json!({}))).unwrap();
        log.enqueue(NewOperation::insert("b", "1", json!({}))).unwrap();

        let purged = log.purge(Some("a"), Some(&"2".into()));
        assert_eq!(purged.len(), 1);
        assert_eq!(log.peek_count(), 2);

        let purged = log.purge(Some("a"), None);
        assert_eq!(purged.len(), 1);
        assert!(log.has_table("b"));
        assert!(!log.has_table("a"));

        assert_eq!(log.purge(None, None).len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn restore_keeps_counter_and_clears_attempts() {
        let mut log = OperationLog::new();
        log.enqueue(NewOperation::insert("t", "x", json!({}))).unwrap();
        log.enqueue(NewOperation::insert("t", "y", json!({}))).unwrap();
        log.mark_in_flight(2).unwrap();
        log.remove(1);

        let ops: Vec<_> = log.iter().cloned().collect();
        let restored = OperationLog::restore(ops, log.next_sequence()).unwrap();

        assert_eq!(restored.next_sequence(), 3);
        assert_eq!(
            restored.get("t", &"y".into()).unwrap().state,
            OperationState::Pending
        );
        assert!(!restored.is_in_flight(2));
    }

    #[test]
    fn restore_rejects_duplicate_targets() {
        let a = PendingOperation::from_new(1, NewOperation::insert("t", "x", json!({})));
        let b = PendingOperation::from_new(2, NewOperation::delete("t", "x", None));
        assert!(OperationLog::restore(vec![a, b], 1).is_err());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Insert(u8),
        Update(u8, i64),
        Delete(u8),
        Push,
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..4).prop_map(Step::Insert),
            (0u8..4, any::<i64>()).prop_map(|(id, n)| Step::Update(id, n)),
            (0u8..4).prop_map(Step::Delete),
            Just(Step::Push),
        ]
    }

    proptest! {
        #[test]
        fn at_most_one_operation_per_record(steps in prop::collection::vec(step(), 0..64)) {
            let mut log = OperationLog::new();
            let mut last_sequence = 0;

            for step in steps {
                let result = match step {
                    Step::Insert(id) => log.enqueue(NewOperation::insert("t", i64::from(id), json!({}))),
                    Step::Update(id, n) => log.enqueue(NewOperation::update("t", i64::from(id), json!({"n": n}), None)),
                    Step::Delete(id) => log.enqueue(NewOperation::delete("t", i64::from(id), None)),
                    Step::Push => {
                        if let Some(op) = log.next_batch(1).pop() {
                            log.mark_in_flight(op.sequence).unwrap();
                            log.complete(op.sequence, op.revision, Some(Version::new("v"))).unwrap();
                        }
                        continue;
                    }
                };

                if let Ok(Collapse::Appended(op)) = &result {
                    prop_assert!(op.sequence > last_sequence);
                    last_sequence = op.sequence;
                }

                let mut targets = BTreeSet::new();
                for op in log.iter() {
                    prop_assert!(targets.insert(op.id.clone()), "duplicate operation for {}", op.id);
                    prop_assert_eq!(log.get(&op.table, &op.id).map(|o| o.sequence), Some(op.sequence));
                }
                prop_assert_eq!(log.index.len(), log.ops.len());
            }
        }
    }
}
