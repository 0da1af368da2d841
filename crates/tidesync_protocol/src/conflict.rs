//! Conflict detection and resolution.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::operation::PendingOperation;
use crate::record::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Outcome of resolving a version conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Re-send the local change against the server's version.
    ClientWins,
    /// Drop the local change and take the server's record.
    ServerWins,
    /// Leave the decision to the application.
    Unresolved,
}

/// A pending operation the server refused because the record moved on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The local operation, as it was when pushed.
    pub operation: PendingOperation,
    /// The server's current record.
    pub server: Record,
    /// How the conflict was (or was not) resolved.
    pub resolution: Resolution,
}

impl ConflictRecord {
    /// Creates an unresolved conflict.
    pub fn new(operation: PendingOperation, server: Record) -> Self {
        Self {
            operation,
            server,
            resolution: Resolution::Unresolved,
        }
    }

    /// Sequence of the conflicting operation.
    pub fn sequence(&self) -> u64 {
        self.operation.sequence
    }

    /// Returns true if a resolution has been chosen.
    pub fn is_resolved(&self) -> bool {
        self.resolution != Resolution::Unresolved
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

/// Decides version conflicts during push.
///
/// Implementations must be pure: the same inputs always give the same
/// resolution. Any `Fn(&PendingOperation, &Record) -> Resolution` closure is a
/// resolver.
pub trait ConflictResolver: Send + Sync {
    /// Chooses a resolution for a pending operation and the server's record.
    fn resolve(&self, pending: &PendingOperation, server: &Record) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&PendingOperation, &Record) -> Resolution + Send + Sync,
{
    fn resolve(&self, pending: &PendingOperation, server: &Record) -> Resolution {
        self(pending, server)
    }
}

/// Built-in resolution policies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Every conflict is left to the application.
    #[default]
    Manual,
    /// Client always wins.
    ClientWins,
    /// Server always wins.
    ServerWins,
    /// The payload with the greater value in `field` wins.
    ///
    /// Numbers compare numerically, strings lexicographically (ISO-8601
    /// timestamps order correctly). Ties, missing fields and mismatched
    /// types go to the server.
    LastWriterWins {
        /// Payload field holding the modification time.
        field: String,
    },
}

impl ConflictPolicy {
    /// Returns true if this policy resolves conflicts without the application.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }
}

impl ConflictResolver for ConflictPolicy {
    fn resolve(&self, pending: &PendingOperation, server: &Record) -> Resolution {
        match self {
            ConflictPolicy::Manual => Resolution::Unresolved,
            ConflictPolicy::ClientWins => Resolution::ClientWins,
            ConflictPolicy::ServerWins => Resolution::ServerWins,
            ConflictPolicy::LastWriterWins { field } => {
                let local = pending.payload.as_ref().and_then(|p| p.get(field));
                let remote = server.payload.get(field);
                match local.zip(remote).and_then(|(l, r)| compare_stamps(l, r)) {
                    Some(Ordering::Greater) => Resolution::ClientWins,
                    _ => Resolution::ServerWins,
                }
            }
        }
    }
}

fn compare_stamps(local: &Value, remote: &Value) -> Option<Ordering> {
    match (local, remote) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
