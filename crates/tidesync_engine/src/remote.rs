//! Remote service and credential interfaces.
//!
//! The engine talks to the backend only through [`RemoteService`] and asks
//! [`CredentialProvider`] for a token before every call. Neither is
//! implemented for a real network here; [`crate::MemoryRemote`] stands in for
//! tests.

use crate::error::SyncError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tidesync_protocol::{Page, PageRequest, Record, RecordId, Version};

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors a remote service can report.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// The record exists with a different version (or already exists, for a
    /// create).
    #[error("version conflict with the server record")]
    Conflict {
        /// The server's current record.
        current: Box<Record>,
    },

    /// The record does not exist on the server.
    #[error("record not found")]
    NotFound,

    /// The credential was missing, expired or rejected.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The server refused the payload.
    #[error("rejected by server: {0}")]
    Validation(String),

    /// The request did not complete.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error status.
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP-like status code.
        status: u16,
        /// Server message.
        message: String,
    },
}

impl RemoteError {
    /// Builds a conflict error.
    pub fn conflict(current: Record) -> Self {
        RemoteError::Conflict {
            current: Box::new(current),
        }
    }

    /// Returns true for failures worth retrying later (network, 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) => true,
            RemoteError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Conflict { current } => SyncError::VersionConflict {
                table: current.table,
                id: current.id,
            },
            RemoteError::Unauthenticated(message) => SyncError::Unauthenticated(message),
            err if err.is_transient() => SyncError::NetworkFailure(err.to_string()),
            other => SyncError::ValidationFailure(other.to_string()),
        }
    }
}

/// Opaque bearer credential.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token.
    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(..)")
    }
}

/// No credential is available.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no credential available: {0}")]
pub struct NoCredential(pub String);

/// Supplies the current credential. The engine never refreshes tokens.
pub trait CredentialProvider: Send + Sync {
    /// Returns the credential to use for the next remote call.
    fn current_token(&self) -> Result<Credential, NoCredential>;
}

/// Provider holding a fixed token, or none.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credential: Option<Credential>,
}

impl StaticCredentials {
    /// Provider that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Some(Credential::new(token)),
        }
    }

    /// Provider for a signed-out user.
    pub fn signed_out() -> Self {
        Self::default()
    }
}

impl CredentialProvider for StaticCredentials {
    fn current_token(&self) -> Result<Credential, NoCredential> {
        self.credential
            .clone()
            .ok_or_else(|| NoCredential("user is signed out".into()))
    }
}

/// Remote table service with conditional writes.
///
/// Writes must be conditional: creating an id that exists, or replacing or
/// deleting with an `expected` version the server no longer holds, fails
/// with [`RemoteError::Conflict`] instead of applying twice.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Creates a record and returns it with its first version.
    async fn create(
        &self,
        credential: &Credential,
        table: &str,
        id: &RecordId,
        payload: &Value,
    ) -> RemoteResult<Record>;

    /// Replaces a record's payload if it still has version `expected`.
    async fn replace(
        &self,
        credential: &Credential,
        table: &str,
        id: &RecordId,
        payload: &Value,
        expected: Option<&Version>,
    ) -> RemoteResult<Record>;

    /// Deletes a record if it still has version `expected`.
    async fn delete(
        &self,
        credential: &Credential,
        table: &str,
        id: &RecordId,
        expected: Option<&Version>,
    ) -> RemoteResult<()>;

    /// Reads one page of a table.
    async fn query(&self, credential: &Credential, request: &PageRequest) -> RemoteResult<Page>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transient_classification() {
        assert!(RemoteError::Network("reset".into()).is_transient());
        assert!(RemoteError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(!RemoteError::Server {
            status: 413,
            message: "too large".into()
        }
        .is_transient());
        assert!(!RemoteError::NotFound.is_transient());
    }

    #[test]
    fn remote_errors_map_to_public_kinds() {
        let current = Record::new("notes", "a1", json!({})).with_version("v2");
        assert!(matches!(
            SyncError::from(RemoteError::conflict(current)),
            SyncError::VersionConflict { .. }
        ));
        assert!(matches!(
            SyncError::from(RemoteError::Network("down".into())),
            SyncError::NetworkFailure(_)
        ));
        assert!(matches!(
            SyncError::from(RemoteError::Unauthenticated("expired".into())),
            SyncError::Unauthenticated(_)
        ));
        assert!(matches!(
            SyncError::from(RemoteError::Validation("title required".into())),
            SyncError::ValidationFailure(_)
        ));
    }

    #[test]
    fn static_credentials() {
        let provider = StaticCredentials::new("secret");
        assert_eq!(provider.current_token().unwrap().token(), "secret");
        assert_eq!(format!("{:?}", provider.current_token().unwrap()), "Credential(..)");
        assert!(StaticCredentials::signed_out().current_token().is_err());
    }
}
