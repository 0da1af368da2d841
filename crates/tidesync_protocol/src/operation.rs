//! Pending local mutations.

use crate::codec::{from_cbor, to_cbor};
use crate::error::{ProtocolError, ProtocolResult};
use crate::record::{RecordId, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Record created locally.
    Insert,
    /// Record changed locally.
    Update,
    /// Record removed locally.
    Delete,
}

impl OperationKind {
    /// Returns true if the operation carries a payload.
    pub fn has_payload(&self) -> bool {
        !matches!(self, OperationKind::Delete)
    }
}

/// Push state of a pending operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    /// Not yet sent, or sent and retryable.
    Pending,
    /// A remote call was started; the outcome is unknown until it returns.
    Attempted,
    /// The server rejected the payload; excluded from automatic pushes.
    Failed {
        /// Server-provided rejection reason.
        reason: String,
    },
}

/// A mutation as requested by the caller, before sequencing.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Table name.
    pub table: String,
    /// Record identifier.
    pub id: RecordId,
    /// Mutation kind.
    pub kind: OperationKind,
    /// Full record payload after the mutation (Insert/Update).
    pub payload: Option<Value>,
    /// Version the local record had when the mutation was made.
    pub expected_version: Option<Version>,
}

impl NewOperation {
    /// Creates an insert.
    pub fn insert(table: impl Into<String>, id: impl Into<RecordId>, payload: Value) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            kind: OperationKind::Insert,
            payload: Some(payload),
            expected_version: None,
        }
    }

    /// Creates an update.
    pub fn update(
        table: impl Into<String>,
        id: impl Into<RecordId>,
        payload: Value,
        expected_version: Option<Version>,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            kind: OperationKind::Update,
            payload: Some(payload),
            expected_version,
        }
    }

    /// Creates a delete.
    pub fn delete(
        table: impl Into<String>,
        id: impl Into<RecordId>,
        expected_version: Option<Version>,
    ) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            kind: OperationKind::Delete,
            payload: None,
            expected_version,
        }
    }

    /// Checks that the payload matches the kind.
    pub fn validate(&self) -> ProtocolResult<()> {
        match (self.kind.has_payload(), self.payload.is_some()) {
            (true, false) => Err(ProtocolError::InvalidOperation(format!(
                "{:?} of {}/{} requires a payload",
                self.kind, self.table, self.id
            ))),
            (false, true) => Err(ProtocolError::InvalidOperation(format!(
                "delete of {}/{} must not carry a payload",
                self.table, self.id
            ))),
            _ => Ok(()),
        }
    }
}

/// A sequenced mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Position in the log; assigned at enqueue, never reused.
    pub sequence: u64,
    /// Table name.
    pub table: String,
    /// Record identifier.
    pub id: RecordId,
    /// Mutation kind.
    pub kind: OperationKind,
    /// Full record payload (Insert/Update).
    pub payload: Option<Value>,
    /// Version the server must still hold for the write to apply.
    pub expected_version: Option<Version>,
    /// Bumped whenever a later mutation collapses into this one.
    pub revision: u64,
    /// Push state.
    pub state: OperationState,
}

impl PendingOperation {
    pub(crate) fn from_new(sequence: u64, op: NewOperation) -> Self {
        Self {
            sequence,
            table: op.table,
            id: op.id,
            kind: op.kind,
            payload: op.payload,
            expected_version: op.expected_version,
            revision: 0,
            state: OperationState::Pending,
        }
    }

    /// Returns true if the server rejected this operation.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, OperationState::Failed { .. })
    }

    /// Returns true if the operation targets the given record.
    pub fn targets(&self, table: &str, id: &RecordId) -> bool {
        self.table == table && &self.id == id
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_payload_presence() {
        assert!(NewOperation::insert("t", "a", json!({})).validate().is_ok());
        assert!(NewOperation::delete("t", "a", None).validate().is_ok());

        let mut bad = NewOperation::delete("t", "a", None);
        bad.payload = Some(json!({}));
        assert!(bad.validate().is_err());

        let mut bad = NewOperation::insert("t", "a", json!({}));
        bad.payload = None;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn failed_state_survives_encoding() {
        let mut op = PendingOperation::from_new(
            4,
            NewOperation::update("notes", 9i64, json!({"x": 1}), Some(Version::new("v3"))),
        );
        op.state = OperationState::Failed {
            reason: "title too long".into(),
        };

        let decoded = PendingOperation::decode(&op.encode().unwrap()).unwrap();
        assert!(decoded.is_failed());
        assert_eq!(decoded, op);
    }
}
