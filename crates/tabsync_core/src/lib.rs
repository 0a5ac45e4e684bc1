//! # tabsync core
//!
//! Database handle, scoped transactions and the change log for tabsync.
//!
//! This crate provides:
//! - [`Database`]: a per-instance handle over a shared storage backend
//! - [`Transaction`]: exclusive access to a declared set of tables, with
//!   all-or-nothing rollback
//! - The change log ([`changes`]): an append-only, revisioned record of
//!   every observable mutation
//! - Tracked mutations ([`tracked`]): create, put, update and delete that
//!   write the row and its change record together
//!
//! ## Example
//!
//! ```rust
//! use tabsync_core::{changes, tracked, Database, Revision};
//! use tabsync_storage::Value;
//!
//! let db = Database::open_in_memory();
//! let rev = db
//!     .transaction(&["notes", changes::CHANGES_TABLE], |txn| {
//!         tracked::put(txn, "notes", Value::from("k"), Value::from("hello"))
//!     })
//!     .unwrap();
//! assert_eq!(rev, Some(Revision::new(1)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod changes;
mod database;
mod error;
pub mod tracked;
mod transaction;
mod types;

pub use changes::{ChangeKind, ChangeRecord, CHANGES_TABLE};
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use transaction::Transaction;
pub use types::{NodeId, Revision};
