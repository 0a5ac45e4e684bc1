//! Changes command implementation.

use super::{open_existing, value_to_json};
use serde::Serialize;
use std::path::Path;
use tabsync_core::{changes, ChangeRecord, Database, Revision, CHANGES_TABLE};

/// Change record representation for output.
#[derive(Debug, Serialize)]
pub struct ChangeInfo {
    /// Revision of the change.
    pub revision: u64,
    /// `CREATE`, `UPDATE` or `DELETE`.
    pub kind: String,
    /// Table of the mutated row.
    pub table: String,
    /// Key of the mutated row.
    pub key: serde_json::Value,
    /// Source tag of the writing transaction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Row after the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_value: Option<serde_json::Value>,
    /// Changed fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<serde_json::Value>,
    /// Row before the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_value: Option<serde_json::Value>,
}

impl From<&ChangeRecord> for ChangeInfo {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            revision: record.revision.as_u64(),
            kind: record.kind.to_string(),
            table: record.table.clone(),
            key: value_to_json(&record.key),
            source: record.source.clone(),
            new_value: record.new_value.as_ref().map(value_to_json),
            delta: record.delta.as_ref().map(value_to_json),
            old_value: record.old_value.as_ref().map(value_to_json),
        }
    }
}

/// Runs the changes command.
pub fn run(
    path: &Path,
    since: u64,
    limit: usize,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let records = read(&db, since, limit)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(&records);
        }
    }
    Ok(())
}

/// Reads up to `limit` records after revision `since`.
pub fn read(
    db: &Database,
    since: u64,
    limit: usize,
) -> Result<Vec<ChangeInfo>, Box<dyn std::error::Error>> {
    let records = db.transaction(&[CHANGES_TABLE], |txn| {
        changes::read_after(txn, Revision::new(since), limit)
    })?;
    Ok(records.iter().map(ChangeInfo::from).collect())
}

fn print_text_output(records: &[ChangeInfo]) {
    if records.is_empty() {
        println!("No changes.");
        return;
    }
    for record in records {
        let value = record
            .new_value
            .as_ref()
            .or(record.old_value.as_ref())
            .map(ToString::to_string)
            .unwrap_or_default();
        println!(
            "{:>8} {:<6} {}[{}] {}{}",
            record.revision,
            record.kind,
            record.table,
            record.key,
            value,
            record
                .source
                .as_ref()
                .map(|s| format!(" (source: {s})"))
                .unwrap_or_default()
        );
    }
}
