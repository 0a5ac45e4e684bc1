//! Database handle.

use crate::error::{CoreError, CoreResult};
use crate::transaction::Transaction;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tabsync_storage::{FileBackend, InMemoryBackend, StorageBackend};

/// A handle to a shared store.
///
/// Several handles (one per instance) may point at the same backend: an
/// `Arc<InMemoryBackend>` inside one process, or the same directory through
/// [`FileBackend`] across processes. Each handle has its own open/closed
/// state; closing one never affects the others.
///
/// # Example
///
/// ```rust
/// use tabsync_core::Database;
/// use tabsync_storage::Value;
///
/// let db = Database::open_in_memory();
/// db.transaction(&["notes"], |txn| {
///     txn.put("notes", Value::Integer(1), &Value::from("hello"))
/// })
/// .unwrap();
///
/// let note: Option<Value> = db
///     .transaction(&["notes"], |txn| txn.get("notes", &Value::Integer(1)))
///     .unwrap();
/// assert_eq!(note, Some(Value::from("hello")));
/// ```
pub struct Database {
    name: String,
    backend: Arc<dyn StorageBackend>,
    is_open: RwLock<bool>,
}

impl Database {
    /// Opens a file-backed store rooted at `path`.
    ///
    /// The database name is the final path component.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let backend = FileBackend::open(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tabsync".to_string());
        Ok(Self::open_shared(name, Arc::new(backend)))
    }

    /// Opens a private in-memory store.
    #[must_use]
    pub fn open_in_memory() -> Self {
        Self::open_shared("memory", Arc::new(InMemoryBackend::new()))
    }

    /// Opens a new handle on an existing backend.
    pub fn open_shared(name: impl Into<String>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            is_open: RwLock::new(true),
        }
    }

    /// Returns the database name used to scope cross-instance signals.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the underlying backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Executes a function within a transaction over `scope`.
    ///
    /// If the function returns `Ok`, its writes are committed. If it returns
    /// `Err`, every write is reverted and nothing is persisted.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` if this handle is closed, the closure's own
    /// error, or a storage error raised while locking or persisting.
    pub fn transaction<F, T>(&self, scope: &[&str], f: F) -> CoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_, '_>) -> CoreResult<T>,
    {
        self.ensure_open()?;

        let mut body = Some(f);
        let mut outcome: Option<CoreResult<T>> = None;
        self.backend.with_tables(scope, &mut |set| {
            let Some(body) = body.take() else {
                return Ok(false);
            };
            let mut txn = Transaction::new(set);
            let result = body(&mut txn);
            let dirty = match &result {
                Ok(_) => txn.is_dirty(),
                Err(_) => {
                    txn.rollback();
                    false
                }
            };
            outcome = Some(result);
            Ok(dirty)
        })?;

        outcome.unwrap_or_else(|| Err(CoreError::aborted("transaction body did not run")))
    }

    /// Returns the names of all tables in the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle is closed or the backend cannot be
    /// listed.
    pub fn table_names(&self) -> CoreResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.backend.table_names()?)
    }

    /// Closes this handle. Idempotent.
    ///
    /// Transactions already running complete; later calls fail with
    /// `DatabaseClosed`.
    pub fn close(&self) {
        let mut is_open = self.is_open.write();
        if *is_open {
            tracing::debug!(db = %self.name, "database handle closed");
            *is_open = false;
        }
    }

    /// Checks if the handle is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.is_open.read()
    }

    /// Ensures the handle is open.
    pub fn ensure_open(&self) -> CoreResult<()> {
        if *self.is_open.read() {
            Ok(())
        } else {
            Err(CoreError::DatabaseClosed)
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_storage::Value;

    #[test]
    fn open_in_memory() {
        let db = Database::open_in_memory();
        assert!(db.is_open());
        assert_eq!(db.name(), "memory");
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let db = Database::open_in_memory();
        let result: CoreResult<()> = db.transaction(&["t"], |txn| {
            txn.put("t", Value::Integer(1), &Value::from("x"))?;
            txn.add("t", &Value::from("y"))?;
            Err(CoreError::aborted("boom"))
        });
        assert!(matches!(result, Err(CoreError::TransactionAborted { .. })));

        let (count, counter) = db
            .transaction(&["t"], |txn| Ok((txn.count("t")?, txn.key_counter("t")?)))
            .unwrap();
        assert_eq!(count, 0);
        assert_eq!(counter, 0);
    }

    #[test]
    fn closed_handle_rejects_work() {
        let db = Database::open_in_memory();
        db.close();
        db.close();
        let result = db.transaction(&["t"], |_| Ok(()));
        assert!(matches!(result, Err(CoreError::DatabaseClosed)));
        assert!(db.table_names().is_err());
    }

    #[test]
    fn handles_share_a_backend() {
        let backend: Arc<dyn StorageBackend> = Arc::new(InMemoryBackend::new());
        let a = Database::open_shared("shared", Arc::clone(&backend));
        let b = Database::open_shared("shared", backend);

        a.transaction(&["t"], |txn| txn.put("t", Value::Integer(1), &true))
            .unwrap();
        a.close();

        let seen: Option<bool> = b
            .transaction(&["t"], |txn| txn.get("t", &Value::Integer(1)))
            .unwrap();
        assert_eq!(seen, Some(true));
    }

    #[test]
    fn file_store_persists_between_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes");
        {
            let db = Database::open(&path).unwrap();
            assert_eq!(db.name(), "notes");
            db.transaction(&["t"], |txn| txn.add("t", &Value::from("a")))
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let count = db.transaction(&["t"], |txn| txn.count("t")).unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.table_names().unwrap(), vec!["t"]);
    }
}
