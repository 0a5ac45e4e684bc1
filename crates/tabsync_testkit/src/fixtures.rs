//! Test fixtures and store helpers.
//!
//! Provides convenience functions for setting up test stores and common
//! test scenarios.

use std::path::{Path, PathBuf};
use tabsync_core::{tracked, Database, NodeId, Revision, CHANGES_TABLE};
use tabsync_observe::{node, NODES_TABLE};
use tabsync_storage::Value;
use tempfile::TempDir;

/// A test store with automatic cleanup.
pub struct TestStore {
    /// The store handle.
    pub db: Database,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestStore {
    /// Creates a new in-memory test store.
    pub fn memory() -> Self {
        Self {
            db: Database::open_in_memory(),
            _temp_dir: None,
        }
    }

    /// Creates a new file-backed test store.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open(&temp_dir.path().join("store")).expect("Failed to open file store");
        Self {
            db,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Returns the store directory if file-backed, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        self._temp_dir.as_ref().map(|d| d.path().join("store"))
    }
}

impl std::ops::Deref for TestStore {
    type Target = Database;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

/// Runs a test with a temporary in-memory store.
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let store = TestStore::memory();
    f(&store.db)
}

/// Runs a test with a temporary file-backed store.
pub fn with_file_store<F, R>(f: F) -> R
where
    F: FnOnce(&Database, &Path) -> R,
{
    let store = TestStore::file();
    let path = store.path().expect("File store should have a path");
    f(&store.db, &path)
}

/// Creates `count` rows in `table`, one change record each.
///
/// Returns the revision of the last record.
pub fn populate(db: &Database, table: &str, count: usize) -> Revision {
    db.transaction(&[table, CHANGES_TABLE], |txn| {
        let mut last = Revision::ZERO;
        for n in 0..count {
            let n = i64::try_from(n).unwrap_or(i64::MAX);
            last = tracked::create(txn, table, None, Value::object([("n", Value::Integer(n))]))?.1;
        }
        Ok(last)
    })
    .expect("Failed to populate store")
}

/// Registers a local node directly in the registry.
pub fn register_node(db: &Database, my_revision: Revision, now_ms: u64) -> NodeId {
    db.transaction(&[NODES_TABLE], |txn| {
        node::insert_local(txn, my_revision, now_ms)
    })
    .expect("Failed to register node")
}
