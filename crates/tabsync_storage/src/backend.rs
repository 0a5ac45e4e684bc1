//! Storage backend trait definition.

use crate::error::StorageResult;
use crate::table::TableSet;

/// A storage backend for tabsync.
///
/// Backends hold named [`Table`](crate::Table)s and hand out exclusive,
/// scoped access to them. They know nothing about change records, nodes or
/// messages; all interpretation happens in the layers above.
///
/// # Invariants
///
/// - `with_tables` holds an exclusive lock on every table in `scope` for the
///   whole call, acquired in sorted name order
/// - Calls with disjoint scopes may run concurrently
/// - Tables that do not exist yet are created empty on first access
/// - When `f` returns `Ok(true)` the tables are made durable before the
///   locks are released; `Ok(false)` or `Err` persist nothing
/// - Backends must be `Send + Sync`; one backend is typically shared by
///   several database handles (instances)
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - shared in-process storage
/// - [`super::FileBackend`] - one file per table, safe across processes
pub trait StorageBackend: Send + Sync {
    /// Runs `f` with exclusive access to the tables named in `scope`.
    ///
    /// `f` returns `true` when it modified the tables and the changes must
    /// be persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if locking, loading or persisting fails, or if `f`
    /// itself fails.
    fn with_tables(
        &self,
        scope: &[&str],
        f: &mut dyn FnMut(&mut TableSet<'_>) -> StorageResult<bool>,
    ) -> StorageResult<()>;

    /// Returns the names of all tables that currently exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed.
    fn table_names(&self) -> StorageResult<Vec<String>>;
}
