//! File-based storage backend shared across processes.

use crate::backend::StorageBackend;
use crate::codec;
use crate::error::{StorageError, StorageResult};
use crate::table::{normalize_scope, Table, TableSet};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const TABLE_EXT: &str = "tbl";
const LOCK_EXT: &str = "lock";
const PENDING_EXT: &str = "pending";
const JOURNAL_EXT: &str = "commit";

/// Points at which a multi-table commit can be made to fail.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitFault {
    /// Fail after the first pending table file is written.
    AfterFirstPending,
    /// Stop dead after the journal is in place, as a crash would.
    AfterJournal,
}

/// A file-based storage backend.
///
/// Every table lives in its own CBOR file inside one directory, next to a
/// lock file. A scoped call takes an OS-level exclusive lock on each lock
/// file (in sorted name order), loads the tables, runs the closure and
/// writes dirty tables back. Several processes can therefore open the same
/// directory and coordinate through it.
///
/// # Commits
///
/// A single dirty table is replaced through a temp file and rename. When
/// several tables are written together, each is first written to
/// `<table>.<txid>.pending`, then a `<txid>.commit` journal naming them is
/// renamed into place. The journal's appearance is the commit point: the
/// pending files are then renamed over the tables and the journal removed.
/// Every scoped call first finishes any journaled commit touching its
/// tables and discards pending files with no journal, so a crash at any
/// step leaves either all of the tables updated or none of them.
///
/// # Layout
///
/// ```text
/// <dir>/
/// ├── _changes.tbl
/// ├── _changes.lock
/// ├── _syncNodes.tbl
/// ├── _syncNodes.lock
/// ├── _syncNodes.<txid>.pending   (during a commit)
/// └── <txid>.commit               (during a commit)
/// ```
///
/// # Example
///
/// ```no_run
/// use tabsync_storage::{FileBackend, StorageBackend, Value};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("store")).unwrap();
/// backend
///     .with_tables(&["notes"], &mut |set| {
///         set.table_mut("notes")?.insert(Value::Integer(1), vec![1, 2, 3]);
///         Ok(true)
///     })
///     .unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    #[cfg(test)]
    fault: parking_lot::Mutex<Option<CommitFault>>,
}

impl FileBackend {
    /// Opens or creates a file backend rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            #[cfg(test)]
            fault: parking_lot::Mutex::new(None),
        })
    }

    /// Returns the directory holding the table files.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn table_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{TABLE_EXT}"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{LOCK_EXT}"))
    }

    fn pending_path(&self, name: &str, txid: &str) -> PathBuf {
        self.dir.join(format!("{name}.{txid}.{PENDING_EXT}"))
    }

    fn journal_path(&self, txid: &str) -> PathBuf {
        self.dir.join(format!("{txid}.{JOURNAL_EXT}"))
    }

    fn acquire(&self, name: &str) -> StorageResult<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path(name))?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn load(&self, name: &str) -> StorageResult<Table> {
        let bytes = match fs::read(self.table_path(name)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Table::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(Table::new());
        }
        codec::decode(&bytes)
            .map_err(|e| StorageError::Corrupted(format!("table {name:?}: {e}")))
    }

    fn store(&self, name: &str, table: &Table) -> StorageResult<()> {
        let bytes = codec::encode(table)?;
        let target = self.table_path(name);
        let temp = self.dir.join(format!("{name}.{TABLE_EXT}.tmp"));
        write_synced(&temp, &bytes)?;
        fs::rename(&temp, &target)?;
        Ok(())
    }

    /// Writes every table in the scope as one atomic commit.
    fn commit(&self, names: &[String], tables: &[Table]) -> StorageResult<()> {
        if let ([name], [table]) = (names, tables) {
            return self.store(name, table);
        }

        let txid = Uuid::new_v4().simple().to_string();
        let mut written = Vec::with_capacity(names.len() + 1);
        if let Err(e) = self.stage(names, tables, &txid, &mut written) {
            for path in &written {
                let _ = fs::remove_file(path);
            }
            return Err(e);
        }

        #[cfg(test)]
        self.check_fault(CommitFault::AfterJournal)?;

        // Committed. A failure from here on is finished by the next call
        // that locks these tables.
        let _ = self.apply(&txid, names, names);
        Ok(())
    }

    /// Writes the pending files, then the journal. Records every path it
    /// creates in `written` so a failed stage can be undone.
    fn stage(
        &self,
        names: &[String],
        tables: &[Table],
        txid: &str,
        written: &mut Vec<PathBuf>,
    ) -> StorageResult<()> {
        for (name, table) in names.iter().zip(tables) {
            let pending = self.pending_path(name, txid);
            written.push(pending.clone());
            write_synced(&pending, &codec::encode(table)?)?;

            #[cfg(test)]
            self.check_fault(CommitFault::AfterFirstPending)?;
        }

        let journal = self.journal_path(txid);
        let temp = self.dir.join(format!("{txid}.{JOURNAL_EXT}.tmp"));
        written.push(temp.clone());
        write_synced(&temp, &codec::encode(names)?)?;
        fs::rename(&temp, &journal)?;
        Ok(())
    }

    /// Moves the pending files of `txid` that belong to `locked` over their
    /// tables, and drops the journal once none of its pending files remain.
    fn apply(&self, txid: &str, tables: &[String], locked: &[String]) -> StorageResult<()> {
        for name in tables.iter().filter(|t| locked.contains(*t)) {
            let pending = self.pending_path(name, txid);
            match fs::rename(&pending, self.table_path(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if tables.iter().all(|t| !self.pending_path(t, txid).exists()) {
            match fs::remove_file(self.journal_path(txid)) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Finishes journaled commits touching `locked` and discards their
    /// uncommitted pending files. Callers must hold the locks of `locked`.
    fn recover(&self, locked: &[String]) -> StorageResult<()> {
        let mut orphans = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(txid) = file_name.strip_suffix(&format!(".{JOURNAL_EXT}")) {
                let bytes = fs::read(&path)?;
                let tables: Vec<String> = codec::decode(&bytes)
                    .map_err(|e| StorageError::Corrupted(format!("journal {txid}: {e}")))?;
                if tables.iter().any(|t| locked.contains(t)) {
                    self.apply(txid, &tables, locked)?;
                }
            } else if let Some(stem) = file_name.strip_suffix(&format!(".{PENDING_EXT}")) {
                if let Some((table, txid)) = stem.split_once('.') {
                    if locked.iter().any(|l| l == table) {
                        orphans.push((path.clone(), txid.to_string()));
                    }
                }
            }
        }
        for (path, txid) in orphans {
            if !self.journal_path(&txid).exists() {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn check_fault(&self, at: CommitFault) -> StorageResult<()> {
        if *self.fault.lock() == Some(at) {
            return Err(std::io::Error::other("injected commit fault").into());
        }
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Checks that a table name is usable as a file name stem.
fn validate_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidTableName {
            name: name.to_string(),
        })
    }
}

impl StorageBackend for FileBackend {
    fn with_tables(
        &self,
        scope: &[&str],
        f: &mut dyn FnMut(&mut TableSet<'_>) -> StorageResult<bool>,
    ) -> StorageResult<()> {
        let names = normalize_scope(scope);
        for name in &names {
            validate_name(name)?;
        }

        // Locks are released when the files are dropped.
        let _locks = names
            .iter()
            .map(|n| self.acquire(n))
            .collect::<StorageResult<Vec<File>>>()?;
        self.recover(&names)?;

        let mut tables = names
            .iter()
            .map(|n| self.load(n))
            .collect::<StorageResult<Vec<Table>>>()?;

        let dirty = {
            let mut set = TableSet::new(names.iter().cloned().zip(tables.iter_mut()));
            f(&mut set)?
        };

        if dirty {
            self.commit(&names, &tables)?;
        }
        Ok(())
    }

    fn table_names(&self) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TABLE_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn put(backend: &FileBackend, table: &str, key: i64, row: &[u8]) {
        backend
            .with_tables(&[table], &mut |set| {
                set.table_mut(table)?.insert(Value::Integer(key), row.to_vec());
                Ok(true)
            })
            .unwrap();
    }

    fn get(backend: &FileBackend, table: &str, key: i64) -> Option<Vec<u8>> {
        let mut out = None;
        backend
            .with_tables(&[table], &mut |set| {
                out = set.table(table)?.get(&Value::Integer(key)).map(<[u8]>::to_vec);
                Ok(false)
            })
            .unwrap();
        out
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            put(&backend, "notes", 1, b"persisted");
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(get(&backend, "notes", 1), Some(b"persisted".to_vec()));
        assert_eq!(backend.table_names().unwrap(), vec!["notes"]);
    }

    #[test]
    fn clean_scope_writes_nothing() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        backend
            .with_tables(&["notes"], &mut |set| {
                set.table_mut("notes")?.insert(Value::Integer(1), vec![]);
                Ok(false)
            })
            .unwrap();
        assert_eq!(get(&backend, "notes", 1), None);
    }

    #[test]
    fn failed_closure_writes_nothing() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        let result = backend.with_tables(&["notes"], &mut |set| {
            set.table_mut("notes")?.insert(Value::Integer(1), vec![]);
            Err(StorageError::Closed)
        });
        assert!(result.is_err());
        assert_eq!(get(&backend, "notes", 1), None);
    }

    #[test]
    fn rejects_path_like_names() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        let result = backend.with_tables(&["../escape"], &mut |_| Ok(false));
        assert!(matches!(result, Err(StorageError::InvalidTableName { .. })));
    }

    #[test]
    fn corrupted_table_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("notes.tbl"), [0xff, 0xff, 0x01]).unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        let result = backend.with_tables(&["notes"], &mut |_| Ok(false));
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    fn put_pair(backend: &FileBackend, key: i64, row: &[u8]) -> StorageResult<()> {
        backend.with_tables(&["left", "right"], &mut |set| {
            set.table_mut("left")?.insert(Value::Integer(key), row.to_vec());
            set.table_mut("right")?.insert(Value::Integer(key), row.to_vec());
            Ok(true)
        })
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".pending") || n.ends_with(".commit"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn multi_table_commit_is_all_or_nothing() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        put_pair(&backend, 1, b"old").unwrap();

        *backend.fault.lock() = Some(CommitFault::AfterFirstPending);
        assert!(put_pair(&backend, 1, b"new").is_err());
        *backend.fault.lock() = None;

        assert_eq!(get(&backend, "left", 1), Some(b"old".to_vec()));
        assert_eq!(get(&backend, "right", 1), Some(b"old".to_vec()));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn journaled_commit_is_finished_after_a_crash() {
        let dir = tempdir().unwrap();
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            put_pair(&backend, 1, b"old").unwrap();
            *backend.fault.lock() = Some(CommitFault::AfterJournal);
            assert!(put_pair(&backend, 1, b"new").is_err());
        }
        assert_eq!(leftovers(dir.path()).len(), 3);

        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(get(&backend, "left", 1), Some(b"new".to_vec()));
        assert_eq!(leftovers(dir.path()).len(), 2);
        assert_eq!(get(&backend, "right", 1), Some(b"new".to_vec()));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn uncommitted_pending_files_are_discarded() {
        let dir = tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        put(&backend, "notes", 1, b"kept");
        let table: Table = Table::new();
        fs::write(
            dir.path().join("notes.deadbeef.pending"),
            codec::encode(&table).unwrap(),
        )
        .unwrap();

        assert_eq!(get(&backend, "notes", 1), Some(b"kept".to_vec()));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn concurrent_handles_do_not_lose_updates() {
        let dir = tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                thread::spawn(move || {
                    let backend = Arc::new(FileBackend::open(&path).unwrap());
                    for _ in 0..10 {
                        backend
                            .with_tables(&["counter"], &mut |set| {
                                let table = set.table_mut("counter")?;
                                let key = table.allocate_key();
                                table.insert(Value::Integer(key as i64), vec![]);
                                Ok(true)
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        let mut len = 0;
        backend
            .with_tables(&["counter"], &mut |set| {
                len = set.table("counter")?.len();
                Ok(false)
            })
            .unwrap();
        assert_eq!(len, 40);
    }
}
