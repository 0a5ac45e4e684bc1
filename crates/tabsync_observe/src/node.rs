//! The node registry.
//!
//! Every instance observing a store owns one [`SyncNode`] row in the
//! `_syncNodes` table. The row records how far the instance has read the
//! change log, when it last proved it was alive, whether a peer has marked
//! it for deletion and whether it currently holds mastership.
//!
//! Rows are mutated by their owner (heartbeat, reader) and by other
//! instances (cleanup marks, deletes and demotes them). All functions here
//! run inside a caller-provided transaction whose scope includes
//! [`NODES_TABLE`].

use serde::{Deserialize, Serialize};
use tabsync_core::{CoreResult, NodeId, Revision, Transaction};
use tabsync_storage::Value;

/// Table holding node records.
pub const NODES_TABLE: &str = "_syncNodes";

/// Timestamp written by a node that is shutting down on purpose.
///
/// Lies in the past for every real clock, so peers may evict the node on
/// their next cleanup without waiting for the grace period.
pub const DEAD_DELETE_TIMESTAMP: u64 = 1;

/// Who a node record stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// A running instance on this device.
    Local,
    /// A remote sync endpoint tracked on behalf of the master.
    Remote,
}

/// Connection status of a remote sync endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStatus {
    /// Failed permanently.
    Error,
    /// Not connected.
    Offline,
    /// Connecting.
    Connecting,
    /// Connected and idle.
    Online,
    /// Exchanging changes.
    Syncing,
    /// Failed, a retry is scheduled.
    ErrorWillRetry,
}

/// Maps a remote revision to the local revision it was based on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteBaseRevision {
    /// Revision as reported by the remote.
    pub remote: Value,
    /// Local revision current when the remote revision was applied.
    pub local: Revision,
}

/// State persisted by a downstream sync collaborator for a remote node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteNodeState {
    /// Endpoint address.
    pub url: String,
    /// Name of the sync protocol spoken with the endpoint.
    pub sync_protocol: String,
    /// Protocol options supplied when the connection was set up.
    pub sync_options: Value,
    /// Opaque protocol context.
    pub sync_context: Value,
    /// Last known connection status.
    pub status: RemoteStatus,
    /// Latest remote revision applied locally.
    pub applied_remote_revision: Option<Value>,
    /// Remote/local revision pairs not yet acknowledged.
    pub remote_base_revisions: Vec<RemoteBaseRevision>,
    /// Progress of an initial upload, if one is underway.
    pub db_upload_state: Option<Value>,
}

impl RemoteNodeState {
    /// Creates an offline remote state for `url`.
    pub fn new(url: impl Into<String>, sync_protocol: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sync_protocol: sync_protocol.into(),
            sync_options: Value::Null,
            sync_context: Value::Null,
            status: RemoteStatus::Offline,
            applied_remote_revision: None,
            remote_base_revisions: Vec::new(),
            db_upload_state: None,
        }
    }
}

/// Liveness of a node as judged by a peer.
///
/// `Alive → Suspect → (Alive | Expired)`: a stale node first gets a deletion
/// deadline; if its heartbeat resumes before the deadline it is alive again,
/// otherwise it becomes evictable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLiveness {
    /// Heartbeat within the node timeout.
    Alive,
    /// Heartbeat too old; `delete_at` is the deadline once one is set.
    Suspect {
        /// Deletion deadline, if already marked.
        delete_at: Option<u64>,
    },
    /// Heartbeat too old and deletion deadline passed.
    Expired,
}

/// A participant record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncNode {
    /// Registry key.
    pub id: NodeId,
    /// Highest revision this node has read.
    pub my_revision: Revision,
    /// Local instance or remote endpoint.
    pub kind: NodeKind,
    /// Last heartbeat, epoch milliseconds.
    pub last_heartbeat: u64,
    /// Deletion deadline set by a peer (or by the node itself when dying).
    pub delete_timestamp: Option<u64>,
    /// Whether the node holds mastership.
    pub is_master: bool,
    /// Remote-only state.
    pub remote: Option<RemoteNodeState>,
}

impl SyncNode {
    /// Returns true if the heartbeat is within `timeout_ms` of `now_ms`.
    #[must_use]
    pub fn is_alive(&self, now_ms: u64, timeout_ms: u64) -> bool {
        self.last_heartbeat >= now_ms.saturating_sub(timeout_ms)
    }

    /// Returns true once the node was marked dead by `mark_dead`.
    #[must_use]
    pub fn is_dying(&self) -> bool {
        self.delete_timestamp == Some(DEAD_DELETE_TIMESTAMP)
    }

    /// Classifies the node.
    #[must_use]
    pub fn liveness(&self, now_ms: u64, timeout_ms: u64) -> NodeLiveness {
        if self.is_alive(now_ms, timeout_ms) {
            return NodeLiveness::Alive;
        }
        match self.delete_timestamp {
            Some(deadline) if deadline < now_ms => NodeLiveness::Expired,
            delete_at => NodeLiveness::Suspect { delete_at },
        }
    }
}

fn node_key(id: NodeId) -> Value {
    Value::Integer(i64::try_from(id.as_u64()).unwrap_or(i64::MAX))
}

/// Registers a new local node and returns its id.
pub fn insert_local(
    txn: &mut Transaction<'_, '_>,
    my_revision: Revision,
    now_ms: u64,
) -> CoreResult<NodeId> {
    let id = NodeId::new(txn.allocate_key(NODES_TABLE)?);
    store(
        txn,
        &SyncNode {
            id,
            my_revision,
            kind: NodeKind::Local,
            last_heartbeat: now_ms,
            delete_timestamp: None,
            is_master: false,
            remote: None,
        },
    )?;
    Ok(id)
}

/// Registers a remote endpoint and returns its id.
pub fn register_remote(
    txn: &mut Transaction<'_, '_>,
    state: RemoteNodeState,
    my_revision: Revision,
    now_ms: u64,
) -> CoreResult<NodeId> {
    let id = NodeId::new(txn.allocate_key(NODES_TABLE)?);
    store(
        txn,
        &SyncNode {
            id,
            my_revision,
            kind: NodeKind::Remote,
            last_heartbeat: now_ms,
            delete_timestamp: None,
            is_master: false,
            remote: Some(state),
        },
    )?;
    Ok(id)
}

/// Applies `f` to the remote state of node `id`.
///
/// Returns false if the node is gone or is not a remote node.
pub fn update_remote(
    txn: &mut Transaction<'_, '_>,
    id: NodeId,
    f: impl FnOnce(&mut RemoteNodeState),
) -> CoreResult<bool> {
    let Some(mut node) = load(txn, id)? else {
        return Ok(false);
    };
    let Some(remote) = node.remote.as_mut() else {
        return Ok(false);
    };
    f(remote);
    store(txn, &node)?;
    Ok(true)
}

/// Loads node `id`.
pub fn load(txn: &Transaction<'_, '_>, id: NodeId) -> CoreResult<Option<SyncNode>> {
    txn.get(NODES_TABLE, &node_key(id))
}

/// Writes a node record.
pub fn store(txn: &mut Transaction<'_, '_>, node: &SyncNode) -> CoreResult<()> {
    txn.put(NODES_TABLE, node_key(node.id), node)
}

/// Deletes node `id`. Returns whether it existed.
pub fn remove(txn: &mut Transaction<'_, '_>, id: NodeId) -> CoreResult<bool> {
    txn.delete(NODES_TABLE, &node_key(id))
}

/// Returns every node in id order.
pub fn all(txn: &Transaction<'_, '_>) -> CoreResult<Vec<SyncNode>> {
    Ok(txn
        .scan::<SyncNode>(NODES_TABLE)?
        .into_iter()
        .map(|(_, node)| node)
        .collect())
}

/// Refreshes the heartbeat of node `id` and clears its deletion mark.
///
/// Returns `None` if the node no longer exists.
pub fn touch(
    txn: &mut Transaction<'_, '_>,
    id: NodeId,
    now_ms: u64,
) -> CoreResult<Option<SyncNode>> {
    let Some(mut node) = load(txn, id)? else {
        return Ok(None);
    };
    node.last_heartbeat = now_ms;
    node.delete_timestamp = None;
    store(txn, &node)?;
    Ok(Some(node))
}

/// Marks node `id` as deliberately dead.
///
/// Returns whether the node existed.
pub fn mark_dead(txn: &mut Transaction<'_, '_>, id: NodeId) -> CoreResult<bool> {
    let Some(mut node) = load(txn, id)? else {
        return Ok(false);
    };
    node.delete_timestamp = Some(DEAD_DELETE_TIMESTAMP);
    node.last_heartbeat = 0;
    store(txn, &node)?;
    Ok(true)
}

/// Result of one election pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Election {
    /// The node holding mastership after the pass.
    pub master: NodeId,
    /// True if the running node was promoted by this pass.
    pub promoted: bool,
    /// Master records demoted by this pass.
    pub demoted: Vec<NodeId>,
}

/// Runs the election rule from the point of view of node `me`.
///
/// Records are visited by `is_master` descending, then id ascending. The
/// first master that is alive keeps mastership (`me` always counts as
/// alive); every other master is demoted. If no master qualifies, `me` is
/// promoted. The rule is deterministic, so passes run by different nodes
/// converge on one master.
///
/// Returns `None` if `me` is no longer registered.
pub fn elect(
    txn: &mut Transaction<'_, '_>,
    me: NodeId,
    now_ms: u64,
    timeout_ms: u64,
) -> CoreResult<Option<Election>> {
    let mut nodes = all(txn)?;
    if !nodes.iter().any(|n| n.id == me) {
        return Ok(None);
    }
    nodes.sort_by(|a, b| b.is_master.cmp(&a.is_master).then(a.id.cmp(&b.id)));

    let mut winner: Option<NodeId> = None;
    let mut demoted = Vec::new();
    for node in nodes.iter_mut().filter(|n| n.is_master) {
        let eligible = node.kind == NodeKind::Local
            && (node.id == me || node.is_alive(now_ms, timeout_ms));
        if winner.is_none() && eligible {
            winner = Some(node.id);
        } else {
            node.is_master = false;
            store(txn, node)?;
            demoted.push(node.id);
        }
    }

    let (master, promoted) = match winner {
        Some(id) => (id, false),
        None => {
            if let Some(node) = nodes.iter_mut().find(|n| n.id == me) {
                node.is_master = true;
                store(txn, node)?;
            }
            (me, true)
        }
    };

    Ok(Some(Election {
        master,
        promoted,
        demoted,
    }))
}
