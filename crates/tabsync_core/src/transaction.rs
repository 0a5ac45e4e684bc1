//! Scoped transactions with undo-log rollback.
//!
//! A transaction owns exclusive access to the tables named in its scope for
//! as long as its closure runs:
//! - **Atomicity**: every write is recorded in an undo log and reverted if
//!   the closure fails, including auto-increment allocations
//! - **Isolation**: no other transaction can touch a table in scope until
//!   this one finishes
//! - **Durability**: the backend persists the tables before releasing them

use crate::error::CoreResult;
use crate::types::Revision;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use tabsync_storage::{decode, encode, TableSet, Value};

#[derive(Debug)]
enum Undo {
    Row {
        table: String,
        key: Value,
        previous: Option<Vec<u8>>,
    },
    Counter {
        table: String,
        counter: u64,
    },
}

/// An open transaction over a fixed set of tables.
///
/// Obtained from [`Database::transaction`](crate::Database::transaction);
/// never constructed directly by callers.
pub struct Transaction<'t, 's> {
    set: &'t mut TableSet<'s>,
    undo: Vec<Undo>,
    counters_saved: HashSet<String>,
    source: Option<String>,
    last_revision: Option<Revision>,
}

impl<'t, 's> Transaction<'t, 's> {
    pub(crate) fn new(set: &'t mut TableSet<'s>) -> Self {
        Self {
            set,
            undo: Vec::new(),
            counters_saved: HashSet::new(),
            source: None,
            last_revision: None,
        }
    }

    /// Tags every change record appended by this transaction.
    pub fn set_source(&mut self, source: Option<String>) {
        self.source = source;
    }

    /// Returns the source tag of this transaction.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Returns the last revision appended to the change log by this
    /// transaction, if any.
    #[must_use]
    pub fn last_revision(&self) -> Option<Revision> {
        self.last_revision
    }

    pub(crate) fn note_revision(&mut self, revision: Revision) {
        self.last_revision = Some(revision);
    }

    /// Returns true if the transaction has written anything.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.undo.is_empty()
    }

    fn save_counter(&mut self, table: &str) -> CoreResult<()> {
        if self.counters_saved.contains(table) {
            return Ok(());
        }
        let counter = self.set.table(table)?.key_counter();
        self.undo.push(Undo::Counter {
            table: table.to_string(),
            counter,
        });
        self.counters_saved.insert(table.to_string());
        Ok(())
    }

    /// Reads and decodes the row stored under `key`.
    pub fn get<T: DeserializeOwned>(&self, table: &str, key: &Value) -> CoreResult<Option<T>> {
        match self.set.table(table)?.get(key) {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Inserts or replaces the row stored under `key`.
    pub fn put<T: Serialize + ?Sized>(
        &mut self,
        table: &str,
        key: Value,
        row: &T,
    ) -> CoreResult<()> {
        let bytes = encode(row)?;
        self.save_counter(table)?;
        let previous = self.set.table_mut(table)?.insert(key.clone(), bytes);
        self.undo.push(Undo::Row {
            table: table.to_string(),
            key,
            previous,
        });
        Ok(())
    }

    /// Allocates the next auto-increment key of `table`.
    pub fn allocate_key(&mut self, table: &str) -> CoreResult<u64> {
        self.save_counter(table)?;
        Ok(self.set.table_mut(table)?.allocate_key())
    }

    /// Inserts a row under a freshly allocated key and returns the key.
    pub fn add<T: Serialize + ?Sized>(&mut self, table: &str, row: &T) -> CoreResult<u64> {
        let key = self.allocate_key(table)?;
        self.put(table, Value::Integer(key_to_i64(key)), row)?;
        Ok(key)
    }

    /// Deletes the row stored under `key`. Returns whether a row existed.
    pub fn delete(&mut self, table: &str, key: &Value) -> CoreResult<bool> {
        let previous = self.set.table_mut(table)?.remove(key);
        let existed = previous.is_some();
        if existed {
            self.undo.push(Undo::Row {
                table: table.to_string(),
                key: key.clone(),
                previous,
            });
        }
        Ok(existed)
    }

    /// Returns up to `limit` decoded rows with keys strictly after `after`.
    pub fn scan_after<T: DeserializeOwned>(
        &self,
        table: &str,
        after: Option<&Value>,
        limit: usize,
    ) -> CoreResult<Vec<(Value, T)>> {
        self.set
            .table(table)?
            .range_after(after, limit)
            .into_iter()
            .map(|(k, bytes)| Ok((k.clone(), decode(bytes)?)))
            .collect()
    }

    /// Returns every decoded row of `table` in key order.
    pub fn scan<T: DeserializeOwned>(&self, table: &str) -> CoreResult<Vec<(Value, T)>> {
        self.scan_after(table, None, usize::MAX)
    }

    /// Returns the row with the greatest key.
    pub fn last<T: DeserializeOwned>(&self, table: &str) -> CoreResult<Option<(Value, T)>> {
        match self.set.table(table)?.last() {
            Some((k, bytes)) => Ok(Some((k.clone(), decode(bytes)?))),
            None => Ok(None),
        }
    }

    /// Returns all keys strictly below `upper`.
    pub fn keys_below(&self, table: &str, upper: &Value) -> CoreResult<Vec<Value>> {
        Ok(self.set.table(table)?.keys_below(upper))
    }

    /// Returns the number of rows in `table`.
    pub fn count(&self, table: &str) -> CoreResult<usize> {
        Ok(self.set.table(table)?.len())
    }

    /// Returns the auto-increment position of `table`.
    pub fn key_counter(&self, table: &str) -> CoreResult<u64> {
        Ok(self.set.table(table)?.key_counter())
    }

    /// Reverts every write made by this transaction.
    ///
    /// Undo entries are only recorded after a successful write, so their
    /// tables are always in scope.
    pub(crate) fn rollback(&mut self) {
        while let Some(entry) = self.undo.pop() {
            match entry {
                Undo::Row {
                    table,
                    key,
                    previous,
                } => {
                    let target = self.set.table_mut(&table);
                    debug_assert!(
                        target.is_ok(),
                        "undo entry for {table:?} outside the transaction scope"
                    );
                    if let Ok(t) = target {
                        match previous {
                            Some(bytes) => {
                                t.insert(key, bytes);
                            }
                            None => {
                                t.remove(&key);
                            }
                        }
                    }
                }
                Undo::Counter { table, counter } => {
                    let target = self.set.table_mut(&table);
                    debug_assert!(
                        target.is_ok(),
                        "undo entry for {table:?} outside the transaction scope"
                    );
                    if let Ok(t) = target {
                        t.set_key_counter(counter);
                    }
                }
            }
        }
        self.counters_saved.clear();
        self.last_revision = None;
    }
}

/// Converts an auto-increment key into its stored integer form.
pub(crate) fn key_to_i64(key: u64) -> i64 {
    i64::try_from(key).unwrap_or(i64::MAX)
}
