//! # tabsync storage
//!
//! Table storage backends for tabsync.
//!
//! This crate provides the lowest-level storage abstraction: named, ordered
//! tables of opaque rows, accessed through scoped exclusive locks. Backends
//! do not interpret rows; change records, nodes and messages are defined by
//! the crates above.
//!
//! ## Design Principles
//!
//! - A transaction declares its scope up front and locks exactly those tables
//! - Locks are always taken in sorted name order
//! - Must be `Send + Sync` so one backend can serve many instances
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and instances within one process
//! - [`FileBackend`] - For instances in separate processes sharing a directory
//!
//! ## Example
//!
//! ```rust
//! use tabsync_storage::{decode, encode, InMemoryBackend, StorageBackend, Value};
//!
//! let backend = InMemoryBackend::new();
//! backend
//!     .with_tables(&["notes"], &mut |set| {
//!         let table = set.table_mut("notes")?;
//!         let key = table.allocate_key();
//!         table.insert(Value::Integer(key as i64), encode(&Value::from("hi"))?);
//!         Ok(true)
//!     })
//!     .unwrap();
//!
//! let table = backend.snapshot("notes").unwrap();
//! let (_, row) = table.last().unwrap();
//! let value: Value = decode(row).unwrap();
//! assert_eq!(value.as_text(), Some("hi"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod codec;
mod error;
mod file;
mod memory;
mod table;
mod value;

pub use backend::StorageBackend;
pub use codec::{decode, encode};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use table::{normalize_scope, Table, TableSet};
pub use value::Value;
