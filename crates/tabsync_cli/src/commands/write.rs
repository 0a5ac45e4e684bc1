//! Put and delete command implementations.
//!
//! Both write a tracked mutation and announce the new revision in the
//! store's signal directory, so running watchers pick it up without waiting
//! for their next poll.

use super::{json_to_value, open_existing, parse_key, signal_dir};
use std::path::Path;
use tabsync_core::{tracked, Database, Revision, CHANGES_TABLE};
use tabsync_observe::{Notifier, SharedDirNotifier, Signal};
use tabsync_storage::Value;

/// Runs the put command.
pub fn put(
    path: &Path,
    table: &str,
    key: &str,
    value: &str,
    source: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let key = parse_key(key)?;
    let value = json_to_value(&serde_json::from_str(value)?)?;

    match put_row(&db, table, key, value, source)? {
        Some(revision) => {
            announce(path, &db, revision);
            println!("{table}: written at revision {}", revision.as_u64());
        }
        None => println!("{table}: unchanged"),
    }
    Ok(())
}

/// Runs the delete command.
pub fn delete(
    path: &Path,
    table: &str,
    key: &str,
    source: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let key = parse_key(key)?;

    match delete_row(&db, table, key, source)? {
        Some(revision) => {
            announce(path, &db, revision);
            println!("{table}: deleted at revision {}", revision.as_u64());
        }
        None => println!("{table}: no such row"),
    }
    Ok(())
}

/// Creates or replaces a row, returning the new revision.
pub fn put_row(
    db: &Database,
    table: &str,
    key: Value,
    value: Value,
    source: Option<&str>,
) -> Result<Option<Revision>, Box<dyn std::error::Error>> {
    Ok(db.transaction(&[table, CHANGES_TABLE], |txn| {
        txn.set_source(source.map(str::to_string));
        tracked::put(txn, table, key, value)
    })?)
}

/// Deletes a row, returning the new revision.
pub fn delete_row(
    db: &Database,
    table: &str,
    key: Value,
    source: Option<&str>,
) -> Result<Option<Revision>, Box<dyn std::error::Error>> {
    Ok(db.transaction(&[table, CHANGES_TABLE], |txn| {
        txn.set_source(source.map(str::to_string));
        tracked::delete(txn, table, key)
    })?)
}

fn announce(path: &Path, db: &Database, revision: Revision) {
    match SharedDirNotifier::open(&signal_dir(path)) {
        Ok(notifier) => notifier.publish(Signal::Revision {
            db: db.name().to_string(),
            revision,
        }),
        Err(e) => tracing::warn!(error = %e, "could not announce revision"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_core::CoreError;

    #[test]
    fn put_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();

        let rev = put_row(&db, "notes", Value::Integer(1), Value::from("x"), Some("cli")).unwrap();
        assert_eq!(rev, Some(Revision::new(1)));
        let same = put_row(&db, "notes", Value::Integer(1), Value::from("x"), None).unwrap();
        assert_eq!(same, None);

        assert_eq!(
            delete_row(&db, "notes", Value::Integer(1), None).unwrap(),
            Some(Revision::new(2))
        );
        assert_eq!(delete_row(&db, "notes", Value::Integer(1), None).unwrap(), None);
    }

    #[test]
    fn internal_tables_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let err = put_row(&db, "_syncNodes", Value::Integer(1), Value::Null, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::ProtectedTable { .. })
        ));
    }

    #[test]
    fn put_command_announces_revision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes");
        Database::open(&path).unwrap();

        put(&path, "items", "\"a\"", r#"{"n": 1}"#, None).unwrap();
        let key = signal_dir(&path).join("latest-revision.notes");
        assert_eq!(std::fs::read_to_string(key).unwrap(), "1");
    }
}
