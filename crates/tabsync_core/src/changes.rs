//! The change log.
//!
//! Every observable mutation appends one [`ChangeRecord`] to the `_changes`
//! table inside the transaction that performs it. The record's key is its
//! revision, taken from the table's auto-increment counter, so revisions are
//! strictly increasing and never reused. If the transaction fails the record
//! is rolled back with it.
//!
//! Records are immutable; the only removal is [`prune_before`], used by
//! cleanup once no live node still needs them.

use crate::error::{CoreError, CoreResult};
use crate::transaction::{key_to_i64, Transaction};
use crate::types::Revision;
use serde::{Deserialize, Serialize};
use tabsync_storage::Value;

/// Table holding change records.
pub const CHANGES_TABLE: &str = "_changes";

/// Kind of mutation described by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ChangeKind {
    /// A row was created.
    Create = 1,
    /// A row was modified.
    Update = 2,
    /// A row was removed.
    Delete = 3,
}

impl From<ChangeKind> for u8 {
    fn from(kind: ChangeKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for ChangeKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::Create),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            other => Err(format!("unknown change kind {other}")),
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A single entry of the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Position in the log; assigned on append.
    pub revision: Revision,
    /// Tag of the transaction that produced the change.
    pub source: Option<String>,
    /// Table the mutated row lives in.
    pub table: String,
    /// Key of the mutated row.
    pub key: Value,
    /// What happened to the row.
    pub kind: ChangeKind,
    /// Row after the change (`Create` and `Update`).
    pub new_value: Option<Value>,
    /// Changed fields (`Update` only); removed fields map to `Null`.
    pub delta: Option<Value>,
    /// Row before the change (`Update` and `Delete`).
    pub old_value: Option<Value>,
}

impl ChangeRecord {
    fn blank(table: &str, key: Value, kind: ChangeKind) -> Self {
        Self {
            revision: Revision::ZERO,
            source: None,
            table: table.to_string(),
            key,
            kind,
            new_value: None,
            delta: None,
            old_value: None,
        }
    }

    /// Describes the creation of a row.
    #[must_use]
    pub fn create(table: &str, key: Value, value: Value) -> Self {
        Self {
            new_value: Some(value),
            ..Self::blank(table, key, ChangeKind::Create)
        }
    }

    /// Describes the modification of a row.
    #[must_use]
    pub fn update(table: &str, key: Value, new_value: Value, delta: Value, old_value: Value) -> Self {
        Self {
            new_value: Some(new_value),
            delta: Some(delta),
            old_value: Some(old_value),
            ..Self::blank(table, key, ChangeKind::Update)
        }
    }

    /// Describes the removal of a row.
    #[must_use]
    pub fn delete(table: &str, key: Value, old_value: Value) -> Self {
        Self {
            old_value: Some(old_value),
            ..Self::blank(table, key, ChangeKind::Delete)
        }
    }
}

/// Appends a record to the change log and returns its revision.
///
/// The revision and source fields of `record` are overwritten with the
/// allocated revision and the transaction's source tag.
pub fn append(txn: &mut Transaction<'_, '_>, mut record: ChangeRecord) -> CoreResult<Revision> {
    let revision = Revision::new(txn.allocate_key(CHANGES_TABLE)?);
    record.revision = revision;
    record.source = txn.source().map(str::to_string);
    txn.put(CHANGES_TABLE, revision_key(revision), &record)?;
    txn.note_revision(revision);
    Ok(revision)
}

/// Returns the highest revision ever appended, or `Revision::ZERO`.
///
/// Pruning does not lower this value.
pub fn latest_revision(txn: &Transaction<'_, '_>) -> CoreResult<Revision> {
    Ok(Revision::new(txn.key_counter(CHANGES_TABLE)?))
}

/// Returns up to `limit` records with `revision > since`, in order.
pub fn read_after(
    txn: &Transaction<'_, '_>,
    since: Revision,
    limit: usize,
) -> CoreResult<Vec<ChangeRecord>> {
    let rows: Vec<(Value, ChangeRecord)> =
        txn.scan_after(CHANGES_TABLE, Some(&revision_key(since)), limit)?;
    rows.into_iter()
        .map(|(key, record)| {
            if key != revision_key(record.revision) {
                return Err(CoreError::invalid_operation(format!(
                    "change record stored under {key:?} claims {}",
                    record.revision
                )));
            }
            Ok(record)
        })
        .collect()
}

/// Deletes every record with `revision < min`. Returns how many went.
pub fn prune_before(txn: &mut Transaction<'_, '_>, min: Revision) -> CoreResult<usize> {
    let doomed = txn.keys_below(CHANGES_TABLE, &revision_key(min))?;
    for key in &doomed {
        txn.delete(CHANGES_TABLE, key)?;
    }
    Ok(doomed.len())
}

/// Returns the number of records currently in the log.
pub fn count(txn: &Transaction<'_, '_>) -> CoreResult<usize> {
    txn.count(CHANGES_TABLE)
}

fn revision_key(revision: Revision) -> Value {
    Value::Integer(key_to_i64(revision.as_u64()))
}
