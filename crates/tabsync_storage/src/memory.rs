//! In-memory storage backend.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use crate::table::{normalize_scope, Table, TableSet};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// An in-memory storage backend.
///
/// Each table sits behind its own mutex, so transactions over disjoint
/// scopes never wait for each other. Wrap the backend in an `Arc` and open
/// several database handles on it to simulate independent instances
/// sharing one store.
///
/// # Example
///
/// ```rust
/// use tabsync_storage::{InMemoryBackend, StorageBackend, Value};
///
/// let backend = InMemoryBackend::new();
/// backend
///     .with_tables(&["notes"], &mut |set| {
///         let table = set.table_mut("notes")?;
///         table.insert(Value::Integer(1), b"hello".to_vec());
///         Ok(true)
///     })
///     .unwrap();
/// assert_eq!(backend.snapshot("notes").unwrap().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: RwLock<HashMap<String, Arc<Mutex<Table>>>>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, name: &str) -> Arc<Mutex<Table>> {
        if let Some(table) = self.tables.read().get(name) {
            return Arc::clone(table);
        }
        let mut tables = self.tables.write();
        Arc::clone(tables.entry(name.to_string()).or_default())
    }

    /// Returns a copy of a table, waiting for any transaction holding it.
    ///
    /// Useful for testing and debugging.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<Table> {
        let table = self.tables.read().get(name).map(Arc::clone)?;
        let copy = table.lock().clone();
        Some(copy)
    }
}

impl StorageBackend for InMemoryBackend {
    fn with_tables(
        &self,
        scope: &[&str],
        f: &mut dyn FnMut(&mut TableSet<'_>) -> StorageResult<bool>,
    ) -> StorageResult<()> {
        let names = normalize_scope(scope);
        let handles: Vec<Arc<Mutex<Table>>> = names.iter().map(|n| self.handle(n)).collect();
        let mut guards: Vec<MutexGuard<'_, Table>> = handles.iter().map(|h| h.lock()).collect();
        let mut set = TableSet::new(
            names
                .iter()
                .cloned()
                .zip(guards.iter_mut().map(|g| &mut **g)),
        );
        // Nothing to persist: writes already landed in the locked tables.
        f(&mut set)?;
        Ok(())
    }

    fn table_names(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self.tables.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn writes_are_visible_to_later_scopes() {
        let backend = InMemoryBackend::new();
        backend
            .with_tables(&["a"], &mut |set| {
                set.table_mut("a")?.insert(Value::Integer(1), vec![7]);
                Ok(true)
            })
            .unwrap();

        let mut seen = None;
        backend
            .with_tables(&["a"], &mut |set| {
                seen = set.table("a")?.get(&Value::Integer(1)).map(<[u8]>::to_vec);
                Ok(false)
            })
            .unwrap();
        assert_eq!(seen, Some(vec![7]));
    }

    #[test]
    fn disjoint_scopes_do_not_block() {
        let backend = Arc::new(InMemoryBackend::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                backend
                    .with_tables(&["changes"], &mut |_| {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(false)
                    })
                    .unwrap();
            })
        };

        entered_rx.recv().unwrap();
        // "changes" is held; "nodes" must still be available.
        backend
            .with_tables(&["nodes"], &mut |set| {
                set.table_mut("nodes")?.insert(Value::Integer(1), vec![]);
                Ok(true)
            })
            .unwrap();

        release_tx.send(()).unwrap();
        holder.join().unwrap();
    }

    #[test]
    fn overlapping_scopes_serialize() {
        let backend = Arc::new(InMemoryBackend::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                backend
                    .with_tables(&["nodes"], &mut |set| {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        set.table_mut("nodes")?.insert(Value::Integer(1), vec![1]);
                        Ok(true)
                    })
                    .unwrap();
            })
        };

        entered_rx.recv().unwrap();
        let waiter = {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                let mut seen = None;
                backend
                    .with_tables(&["changes", "nodes"], &mut |set| {
                        seen = set.table("nodes")?.get(&Value::Integer(1)).map(<[u8]>::to_vec);
                        Ok(false)
                    })
                    .unwrap();
                seen
            })
        };

        thread::sleep(Duration::from_millis(20));
        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(waiter.join().unwrap(), Some(vec![1]));
    }

    #[test]
    fn table_names_are_sorted() {
        let backend = InMemoryBackend::new();
        backend.with_tables(&["z", "a"], &mut |_| Ok(false)).unwrap();
        assert_eq!(backend.table_names().unwrap(), vec!["a", "z"]);
    }
}
