//! Tracked mutations.
//!
//! These are the only way application code should modify user tables: each
//! call writes the row and appends the matching change record in the same
//! transaction, so the log can never disagree with the data.
//!
//! The transaction scope must include both the user table and
//! [`CHANGES_TABLE`](crate::changes::CHANGES_TABLE).

use crate::changes::{append, ChangeRecord};
use crate::error::{CoreError, CoreResult};
use crate::transaction::{key_to_i64, Transaction};
use crate::types::Revision;
use tabsync_storage::Value;

/// Returns true for tables reserved by tabsync itself.
#[must_use]
pub fn is_internal_table(table: &str) -> bool {
    table.starts_with('_')
}

fn ensure_user_table(table: &str) -> CoreResult<()> {
    if is_internal_table(table) {
        Err(CoreError::ProtectedTable {
            table: table.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Creates a row. With `key == None` the table's auto-increment counter
/// supplies an integer key. Returns the key and the revision.
///
/// # Errors
///
/// Fails with `InvalidOperation` if a row already exists under `key`.
pub fn create(
    txn: &mut Transaction<'_, '_>,
    table: &str,
    key: Option<Value>,
    value: Value,
) -> CoreResult<(Value, Revision)> {
    ensure_user_table(table)?;
    let key = match key {
        Some(key) => {
            if txn.get::<Value>(table, &key)?.is_some() {
                return Err(CoreError::invalid_operation(format!(
                    "row {key:?} already exists in {table}"
                )));
            }
            key
        }
        None => Value::Integer(key_to_i64(txn.allocate_key(table)?)),
    };
    txn.put(table, key.clone(), &value)?;
    let revision = append(txn, ChangeRecord::create(table, key.clone(), value))?;
    Ok((key, revision))
}

/// Creates or fully replaces a row.
///
/// Returns `None` when the stored row already equals `value`.
pub fn put(
    txn: &mut Transaction<'_, '_>,
    table: &str,
    key: Value,
    value: Value,
) -> CoreResult<Option<Revision>> {
    ensure_user_table(table)?;
    match txn.get::<Value>(table, &key)? {
        None => create(txn, table, Some(key), value).map(|(_, rev)| Some(rev)),
        Some(old) if old == value => Ok(None),
        Some(old) => {
            let delta = diff(&old, &value);
            txn.put(table, key.clone(), &value)?;
            append(txn, ChangeRecord::update(table, key, value, delta, old)).map(Some)
        }
    }
}

/// Applies a modification map to an existing row.
///
/// Each entry of `modifications` sets a field; a `Null` entry removes it.
/// Returns `None` when the row does not exist or nothing changed.
///
/// # Errors
///
/// Fails with `InvalidOperation` if `modifications` is not a map or the
/// stored row is not a map.
pub fn update(
    txn: &mut Transaction<'_, '_>,
    table: &str,
    key: Value,
    modifications: &Value,
) -> CoreResult<Option<Revision>> {
    ensure_user_table(table)?;
    let mods = modifications
        .as_map()
        .ok_or_else(|| CoreError::invalid_operation("modifications must be a map"))?;
    let Some(old) = txn.get::<Value>(table, &key)? else {
        return Ok(None);
    };
    let fields = old
        .as_map()
        .ok_or_else(|| CoreError::invalid_operation(format!("row {key:?} is not a map")))?;

    let mut merged: Vec<(Value, Value)> = fields.to_vec();
    for (field, value) in mods {
        merged.retain(|(k, _)| k != field);
        if !value.is_null() {
            merged.push((field.clone(), value.clone()));
        }
    }
    let new = Value::map(merged);
    if new == old {
        return Ok(None);
    }

    let delta = diff(&old, &new);
    txn.put(table, key.clone(), &new)?;
    append(txn, ChangeRecord::update(table, key, new, delta, old)).map(Some)
}

/// Deletes a row. Returns `None` when it did not exist.
pub fn delete(
    txn: &mut Transaction<'_, '_>,
    table: &str,
    key: Value,
) -> CoreResult<Option<Revision>> {
    ensure_user_table(table)?;
    let Some(old) = txn.get::<Value>(table, &key)? else {
        return Ok(None);
    };
    txn.delete(table, &key)?;
    append(txn, ChangeRecord::delete(table, key, old)).map(Some)
}

/// Computes the shallow difference from `old` to `new`.
///
/// For two maps the result holds every field whose value changed, with
/// fields missing from `new` mapped to `Null`. For anything else it is
/// `new` itself.
#[must_use]
pub fn diff(old: &Value, new: &Value) -> Value {
    let (Some(old_fields), Some(new_fields)) = (old.as_map(), new.as_map()) else {
        return new.clone();
    };
    let mut delta = Vec::new();
    for (field, value) in new_fields {
        let before = old_fields.iter().find(|(k, _)| k == field).map(|(_, v)| v);
        if before != Some(value) {
            delta.push((field.clone(), value.clone()));
        }
    }
    for (field, _) in old_fields {
        if !new_fields.iter().any(|(k, _)| k == field) {
            delta.push((field.clone(), Value::Null));
        }
    }
    Value::map(delta)
}
