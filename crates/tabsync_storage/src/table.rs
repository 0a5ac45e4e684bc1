//! Ordered tables and the scoped table set handed to transactions.

use crate::error::{StorageError, StorageResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// A single ordered table.
///
/// Keys are [`Value`]s in their natural order; rows are opaque bytes.
/// Each table owns an auto-increment counter that only moves forward, so
/// keys handed out by [`Table::allocate_key`] are never reused, even after
/// the rows holding them are deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    rows: BTreeMap<Value, Vec<u8>>,
    next_key: u64,
}

impl Table {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the row stored under `key`.
    pub fn get(&self, key: &Value) -> Option<&[u8]> {
        self.rows.get(key).map(Vec::as_slice)
    }

    /// Inserts or replaces a row, returning the previous bytes.
    pub fn insert(&mut self, key: Value, row: Vec<u8>) -> Option<Vec<u8>> {
        // Explicit integer keys push the counter forward so that later
        // allocations cannot collide with them.
        if let Value::Integer(n) = &key {
            if let Ok(n) = u64::try_from(*n) {
                if n >= self.next_key {
                    self.next_key = n;
                }
            }
        }
        self.rows.insert(key, row)
    }

    /// Removes a row, returning its bytes.
    pub fn remove(&mut self, key: &Value) -> Option<Vec<u8>> {
        self.rows.remove(key)
    }

    /// Allocates the next auto-increment key (starting at 1).
    pub fn allocate_key(&mut self) -> u64 {
        self.next_key += 1;
        self.next_key
    }

    /// Returns the current auto-increment position.
    #[must_use]
    pub fn key_counter(&self) -> u64 {
        self.next_key
    }

    /// Restores the auto-increment position (used for rollback).
    pub fn set_key_counter(&mut self, counter: u64) {
        self.next_key = counter;
    }

    /// Returns up to `limit` rows with keys strictly greater than `after`
    /// (or from the start when `after` is `None`), in key order.
    pub fn range_after(&self, after: Option<&Value>, limit: usize) -> Vec<(&Value, &[u8])> {
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        self.rows
            .range::<Value, _>((lower, Bound::Unbounded))
            .take(limit)
            .map(|(k, v)| (k, v.as_slice()))
            .collect()
    }

    /// Returns all keys strictly below `upper`, in key order.
    pub fn keys_below(&self, upper: &Value) -> Vec<Value> {
        self.rows
            .range::<Value, _>((Bound::Unbounded, Bound::Excluded(upper)))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Iterates all rows in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &[u8])> {
        self.rows.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Returns the row with the greatest key.
    pub fn last(&self) -> Option<(&Value, &[u8])> {
        self.rows.iter().next_back().map(|(k, v)| (k, v.as_slice()))
    }

    /// Returns the number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Exclusive access to the tables named in a transaction scope.
///
/// A `TableSet` only exists while the backend holds the locks for every
/// table in it.
pub struct TableSet<'a> {
    tables: BTreeMap<String, &'a mut Table>,
}

impl<'a> TableSet<'a> {
    /// Builds a table set from locked tables.
    pub fn new(tables: impl IntoIterator<Item = (String, &'a mut Table)>) -> Self {
        Self {
            tables: tables.into_iter().collect(),
        }
    }

    /// Returns a table for reading.
    pub fn table(&self, name: &str) -> StorageResult<&Table> {
        self.tables
            .get(name)
            .map(|t| &**t)
            .ok_or_else(|| StorageError::not_in_scope(name))
    }

    /// Returns a table for writing.
    pub fn table_mut(&mut self, name: &str) -> StorageResult<&mut Table> {
        self.tables
            .get_mut(name)
            .map(|t| &mut **t)
            .ok_or_else(|| StorageError::not_in_scope(name))
    }

    /// Returns the names of all tables in scope.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// Normalises a scope: sorted, without duplicates.
///
/// Every backend locks tables in this order, which rules out lock-order
/// deadlocks between overlapping scopes.
pub fn normalize_scope(scope: &[&str]) -> Vec<String> {
    let mut names: Vec<String> = scope.iter().map(|s| (*s).to_string()).collect();
    names.sort();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocated_keys_never_reused() {
        let mut table = Table::new();
        let a = table.allocate_key();
        table.insert(Value::Integer(a as i64), vec![1]);
        table.remove(&Value::Integer(a as i64));
        let b = table.allocate_key();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn explicit_integer_key_advances_counter() {
        let mut table = Table::new();
        table.insert(Value::Integer(10), vec![]);
        assert_eq!(table.allocate_key(), 11);
    }

    #[test]
    fn range_after_is_exclusive_and_limited() {
        let mut table = Table::new();
        for i in 1..=5 {
            table.insert(Value::Integer(i), vec![i as u8]);
        }
        let rows = table.range_after(Some(&Value::Integer(2)), 2);
        let keys: Vec<_> = rows.iter().map(|(k, _)| (*k).clone()).collect();
        assert_eq!(keys, vec![Value::Integer(3), Value::Integer(4)]);

        let all = table.range_after(None, 100);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn keys_below_excludes_bound() {
        let mut table = Table::new();
        for i in 1..=4 {
            table.insert(Value::Integer(i), vec![]);
        }
        assert_eq!(
            table.keys_below(&Value::Integer(3)),
            vec![Value::Integer(1), Value::Integer(2)]
        );
    }

    #[test]
    fn table_set_rejects_out_of_scope() {
        let mut nodes = Table::new();
        let set = TableSet::new([("nodes".to_string(), &mut nodes)]);
        assert!(set.table("nodes").is_ok());
        assert!(matches!(
            set.table("changes"),
            Err(StorageError::TableNotInScope { .. })
        ));
    }

    #[test]
    fn scope_is_sorted_and_deduplicated() {
        assert_eq!(
            normalize_scope(&["b", "a", "b"]),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn range_after_is_sorted_and_strict(
                keys in proptest::collection::btree_set(-50i64..50, 0..40),
                after in -60i64..60,
                limit in 0usize..50,
            ) {
                let mut table = Table::new();
                for k in &keys {
                    table.insert(Value::Integer(*k), vec![]);
                }
                let bound = Value::Integer(after);
                let rows = table.range_after(Some(&bound), limit);
                let expected: Vec<i64> = keys.iter().copied().filter(|k| *k > after).take(limit).collect();
                let got: Vec<i64> = rows.iter().filter_map(|(k, _)| k.as_integer()).collect();
                prop_assert_eq!(got, expected);
            }
        }
    }
}
