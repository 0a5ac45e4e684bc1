//! Inspect command implementation.

use super::open_existing;
use serde::Serialize;
use std::path::Path;
use tabsync_core::{changes, Database, CHANGES_TABLE};
use tabsync_observe::{
    node, Clock, NodeKind, NodeLiveness, ObserveConfig, SystemClock, INTERCOMM_TABLE, NODES_TABLE,
};

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Store name used in notifications.
    pub name: String,
    /// Newest revision ever assigned.
    pub latest_revision: u64,
    /// Change records still in the log.
    pub change_count: usize,
    /// Oldest revision still in the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_revision: Option<u64>,
    /// Current master.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<u64>,
    /// Intercomm messages waiting to be consumed.
    pub pending_messages: usize,
    /// Registered nodes.
    pub nodes: Vec<NodeInfo>,
    /// User tables.
    pub tables: Vec<String>,
}

/// One registry row.
#[derive(Debug, Serialize)]
pub struct NodeInfo {
    /// Node id.
    pub id: u64,
    /// `local` or `remote`.
    pub kind: String,
    /// Highest revision the node has read.
    pub my_revision: u64,
    /// Last heartbeat, epoch milliseconds.
    pub last_heartbeat: u64,
    /// Whether the node holds mastership.
    pub is_master: bool,
    /// `alive`, `suspect` or `expired`, judged with the default timeout.
    pub liveness: String,
    /// Remote endpoint URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_existing(path)?;
    let result = inspect(&db, path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }
    Ok(())
}

/// Collects the inspection result for an open store.
pub fn inspect(db: &Database, path: &Path) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let now = SystemClock.now_ms();
    let timeout = u64::try_from(ObserveConfig::default().node_timeout.as_millis())?;

    let (latest, count, oldest, nodes, pending) = db.transaction(
        &[CHANGES_TABLE, NODES_TABLE, INTERCOMM_TABLE],
        |txn| {
            let latest = changes::latest_revision(txn)?;
            let count = changes::count(txn)?;
            let oldest = changes::read_after(txn, tabsync_core::Revision::ZERO, 1)?
                .first()
                .map(|c| c.revision.as_u64());
            let nodes = node::all(txn)?;
            let pending = tabsync_observe::intercomm::pending_count(txn)?;
            Ok((latest, count, oldest, nodes, pending))
        },
    )?;

    let mut tables: Vec<String> = db
        .table_names()?
        .into_iter()
        .filter(|t| !tabsync_core::tracked::is_internal_table(t))
        .collect();
    tables.sort();

    Ok(InspectResult {
        path: path.display().to_string(),
        name: db.name().to_string(),
        latest_revision: latest.as_u64(),
        change_count: count,
        oldest_revision: oldest,
        master: nodes.iter().find(|n| n.is_master).map(|n| n.id.as_u64()),
        pending_messages: pending,
        nodes: nodes
            .iter()
            .map(|n| NodeInfo {
                id: n.id.as_u64(),
                kind: match n.kind {
                    NodeKind::Local => "local".to_string(),
                    NodeKind::Remote => "remote".to_string(),
                },
                my_revision: n.my_revision.as_u64(),
                last_heartbeat: n.last_heartbeat,
                is_master: n.is_master,
                liveness: match n.liveness(now, timeout) {
                    NodeLiveness::Alive => "alive".to_string(),
                    NodeLiveness::Suspect { .. } => "suspect".to_string(),
                    NodeLiveness::Expired => "expired".to_string(),
                },
                url: n.remote.as_ref().map(|r| r.url.clone()),
            })
            .collect(),
        tables,
    })
}

fn print_text_output(result: &InspectResult) {
    println!("tabsync Store Inspection");
    println!("========================");
    println!();
    println!("Path: {}", result.path);
    println!("Name: {}", result.name);
    println!();
    println!("Change log:");
    println!("  Latest revision: {}", result.latest_revision);
    println!("  Records:         {}", result.change_count);
    if let Some(oldest) = result.oldest_revision {
        println!("  Oldest revision: {oldest}");
    }
    println!();
    println!("Nodes:");
    if result.nodes.is_empty() {
        println!("  (none)");
    }
    for node in &result.nodes {
        println!(
            "  [{}] {} rev {} {}{}",
            node.id,
            node.kind,
            node.my_revision,
            node.liveness,
            if node.is_master { " master" } else { "" }
        );
    }
    println!();
    println!("Pending messages: {}", result.pending_messages);
    println!("Tables: {}", result.tables.join(", "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabsync_core::tracked;
    use tabsync_storage::Value;

    #[test]
    fn reports_log_and_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes");
        let db = Database::open(&path).unwrap();
        db.transaction(&["notes", CHANGES_TABLE, NODES_TABLE], |txn| {
            tracked::create(txn, "notes", None, Value::from("a"))?;
            tracked::create(txn, "notes", None, Value::from("b"))?;
            let id = node::insert_local(txn, tabsync_core::Revision::new(2), 0)?;
            node::elect(txn, id, 0, 5_000)?;
            Ok(())
        })
        .unwrap();

        let result = inspect(&db, &path).unwrap();
        assert_eq!(result.name, "notes");
        assert_eq!(result.latest_revision, 2);
        assert_eq!(result.change_count, 2);
        assert_eq!(result.oldest_revision, Some(1));
        assert_eq!(result.master, Some(1));
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].liveness, "suspect");
        assert_eq!(result.tables, vec!["notes".to_string()]);
    }

    #[test]
    fn missing_store_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(&dir.path().join("absent"), "text").is_err());
    }
}
