//! # Tidesync Engine
//!
//! Offline-first sync between a local store and a remote table service.
//!
//! This crate provides:
//! - A durable local store for records and engine state
//! - An operation log that collapses repeated mutations of a record
//! - A push engine with conditional writes and conflict resolution
//! - An incremental, watermark-based pull engine
//! - An in-memory remote service for tests
//!
//! ## Architecture
//!
//! The application mutates records through [`SyncContext`]. Each mutation
//! is applied to the [`LocalStore`] and queued in the operation log in the
//! same atomic write. A push sends queued operations in sequence order; a
//! pull pages server changes in per named query. [`SyncContext::sync`]
//! pulls first, then pushes.
//!
//! ## Key Invariants
//!
//! - At most one pending operation per record
//! - An acknowledged operation is never sent again
//! - A pending local change is never overwritten by a pull
//! - Cursors only move forward, and are persisted with the records they cover
//! - One push at a time, and one pull per query at a time

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod error;
mod memory_remote;
mod pull;
mod push;
mod remote;
mod state;
mod store;

pub use config::SyncConfig;
pub use context::{SyncContext, SyncCycleResult};
pub use error::{SyncError, SyncResult};
pub use memory_remote::MemoryRemote;
pub use pull::{PullRequest, PullResult};
pub use push::PushResult;
pub use remote::{
    Credential, CredentialProvider, NoCredential, RemoteError, RemoteResult, RemoteService,
    StaticCredentials,
};
pub use state::{CancelToken, SyncStats};
pub use store::{check_table_name, LocalStore, Records, StoreBatch};
