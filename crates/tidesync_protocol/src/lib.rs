//! # tidesync protocol
//!
//! Data model and pure algorithms of the tidesync offline engine.
//!
//! This crate provides:
//! - [`Record`] and its identity types ([`RecordId`], [`Version`], [`Watermark`])
//! - [`PendingOperation`] and the collapsing [`OperationLog`]
//! - [`QueryCursor`] for resumable incremental pulls
//! - [`ConflictRecord`], [`ConflictResolver`] and built-in [`ConflictPolicy`]s
//! - Remote query types ([`PageRequest`], [`Page`], [`Filter`])
//! - CBOR encoding for everything that is persisted
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod conflict;
mod cursor;
mod error;
mod messages;
mod operation;
mod oplog;
mod record;

pub use codec::{from_cbor, to_cbor};
pub use conflict::{ConflictPolicy, ConflictRecord, ConflictResolver, Resolution};
pub use cursor::{PageOutcome, QueryCursor};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{Filter, OrderBy, Page, PageRequest};
pub use operation::{NewOperation, OperationKind, OperationState, PendingOperation};
pub use oplog::{Collapse, Completion, OperationLog};
pub use record::{merge_payload, Record, RecordId, Version, Watermark};
