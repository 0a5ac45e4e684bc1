//! Property-based test generators using proptest.
//!
//! Provides strategies for generating store values and mutation sequences.

use proptest::prelude::*;
use tabsync_core::{tracked, CoreResult, Revision, Transaction};
use tabsync_storage::Value;

/// Strategy for generating valid user table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating scalar values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::Text),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ]
}

/// Strategy for generating nested values up to three levels deep.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::vec(("[a-z]{1,6}", inner), 0..4).prop_map(|fields| {
                Value::map(
                    fields
                        .into_iter()
                        .map(|(k, v)| (Value::Text(k), v))
                        .collect(),
                )
            }),
        ]
    })
}

/// Strategy for generating small object rows.
pub fn row_strategy() -> impl Strategy<Value = Value> {
    prop::collection::vec(("[a-z]{1,6}", scalar_strategy()), 1..5).prop_map(|fields| {
        Value::map(
            fields
                .into_iter()
                .map(|(k, v)| (Value::Text(k), v))
                .collect(),
        )
    })
}

/// A tracked mutation on a small key space.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Create or replace a row.
    Put {
        /// Row key.
        key: i64,
        /// New row.
        row: Value,
    },
    /// Delete a row.
    Delete {
        /// Row key.
        key: i64,
    },
}

impl Mutation {
    /// Applies the mutation to `table`. Returns the revision if a change
    /// record was appended.
    pub fn apply(&self, txn: &mut Transaction<'_, '_>, table: &str) -> CoreResult<Option<Revision>> {
        match self {
            Self::Put { key, row } => tracked::put(txn, table, Value::Integer(*key), row.clone()),
            Self::Delete { key } => tracked::delete(txn, table, Value::Integer(*key)),
        }
    }
}

/// Strategy for generating one mutation over keys `0..8`.
pub fn mutation_strategy() -> impl Strategy<Value = Mutation> {
    prop_oneof![
        3 => (0i64..8, row_strategy()).prop_map(|(key, row)| Mutation::Put { key, row }),
        1 => (0i64..8).prop_map(|key| Mutation::Delete { key }),
    ]
}

/// Strategy for generating mutation sequences.
pub fn mutations_strategy(max_len: usize) -> impl Strategy<Value = Vec<Mutation>> {
    prop::collection::vec(mutation_strategy(), 1..=max_len.max(1))
}

/// Strategy for generating change reader batch limits.
pub fn batch_limit_strategy() -> impl Strategy<Value = usize> {
    1usize..64
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn table_names_are_user_tables(name in table_name_strategy()) {
            prop_assert!(!tracked::is_internal_table(&name));
        }

        #[test]
        fn rows_are_maps(row in row_strategy()) {
            prop_assert!(row.as_map().is_some());
        }
    }
}
