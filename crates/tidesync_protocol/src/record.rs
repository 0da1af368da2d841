//! Records and their identity types.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Caller-defined record identifier, unique within a table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Integer identifier.
    Int(i64),
    /// String identifier.
    Text(String),
}

impl RecordId {
    /// Returns a string key that sorts and compares like the identifier's
    /// storage identity (`i:` / `s:` prefixed).
    pub fn storage_key(&self) -> String {
        match self {
            RecordId::Int(n) => format!("i:{n}"),
            RecordId::Text(s) => format!("s:{s}"),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(n) => write!(f, "{n}"),
            RecordId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::Text(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId::Text(s)
    }
}

impl From<i64> for RecordId {
    fn from(n: i64) -> Self {
        RecordId::Int(n)
    }
}

/// Opaque revision token (ETag-like) used for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    /// Wraps a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Server last-modified watermark in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub i64);

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record of an application table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Table name.
    pub table: String,
    /// Identifier within the table.
    pub id: RecordId,
    /// JSON-like payload.
    pub payload: Value,
    /// Last version known from the server; `None` until first pushed.
    pub version: Option<Version>,
    /// Server last-modified watermark.
    pub updated_at: Option<Watermark>,
    /// Server soft-delete tombstone.
    #[serde(default)]
    pub deleted: bool,
}

impl Record {
    /// Creates a record that only exists locally.
    pub fn new(table: impl Into<String>, id: impl Into<RecordId>, payload: Value) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
            payload,
            version: None,
            updated_at: None,
            deleted: false,
        }
    }

    /// Sets the version token.
    pub fn with_version(mut self, version: impl Into<Version>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Sets the watermark.
    pub fn with_updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = Some(Watermark(updated_at));
        self
    }

    /// Marks the record as a tombstone.
    pub fn tombstone(mut self) -> Self {
        self.deleted = true;
        self
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

/// Shallow-merges `patch` into `base`.
///
/// Object fields of `patch` overwrite those of `base`; any other shape
/// replaces `base` entirely.
pub fn merge_payload(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, patch) => patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_roundtrip_keeps_payload_shape() {
        let record = Record::new("notes", "a1", json!({"text": "hi", "tags": ["x"], "n": 2.5}))
            .with_version("v1")
            .with_updated_at(1_700_000_000_000);

        let decoded = Record::decode(&record.encode().unwrap()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn integer_and_text_ids_do_not_collide() {
        let int = RecordId::from(7i64);
        let text = RecordId::from("7");
        assert_ne!(int.storage_key(), text.storage_key());
        assert_eq!(int.to_string(), text.to_string());

        let decoded: RecordId = from_cbor(&to_cbor(&int).unwrap()).unwrap();
        assert_eq!(decoded, int);
    }

    #[test]
    fn merge_overwrites_fields_and_keeps_others() {
        let merged = merge_payload(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));

        assert_eq!(merge_payload(&json!({"a": 1}), &json!("text")), json!("text"));
    }
}
