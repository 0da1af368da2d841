//! # tidesync storage
//!
//! Durable local storage for the tidesync offline engine.
//!
//! The crate has two layers:
//!
//! - [`StorageBackend`] implementations are **opaque byte stores** (read,
//!   append, sync, truncate). They know nothing about tables or records.
//! - [`TableStore`] builds named key/value tables on top of a backend. Every
//!   [`WriteBatch`] becomes a single checksummed frame, so a batch is either
//!   fully visible after a restart or not visible at all. Once enough dead
//!   frames pile up the log is compacted into a single frame.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral clients
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use tidesync_storage::{TableStore, WriteBatch};
//!
//! let mut store = TableStore::in_memory();
//! let mut batch = WriteBatch::new();
//! batch.put("notes", "a1", b"hello".to_vec());
//! store.write(batch).unwrap();
//! assert_eq!(store.get("notes", "a1"), Some(&b"hello"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod frame;
mod memory;
mod table;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use frame::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use memory::InMemoryBackend;
pub use table::{CompactionPolicy, Mutation, TableScan, TableStore, WriteBatch};
