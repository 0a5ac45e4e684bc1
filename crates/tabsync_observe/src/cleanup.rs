//! Cleanup, eviction and master failover.
//!
//! One pass runs in a single transaction over the registry, the change log
//! and the mailbox:
//!
//! 1. Stale local nodes get a deletion deadline (`now + grace`).
//! 2. Stale nodes past their deadline are deleted. Their reply-expecting
//!    messages are handed to the running node, the rest are dropped. If the
//!    deleted node was master the running node takes over.
//! 3. The election rule runs, demoting stale or duplicate masters.
//! 4. Change records below every remaining node's `my_revision` are pruned.
//!
//! A node that has already been marked dead runs no pass at all.

use crate::clock::duration_ms;
use crate::config::ObserveConfig;
use crate::error::{ObserveError, ObserveResult};
use crate::intercomm::{self, INTERCOMM_TABLE};
use crate::node::{self, NodeKind, NodeLiveness, NODES_TABLE};
use tabsync_core::{changes, Database, NodeId, CHANGES_TABLE};

/// What one cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Nodes deleted by this pass.
    pub evicted: Vec<NodeId>,
    /// Nodes that received a deletion deadline.
    pub marked: Vec<NodeId>,
    /// Master records demoted by the election.
    pub demoted: Vec<NodeId>,
    /// True if the running node became master during this pass.
    pub became_master: bool,
    /// True if the running node is master after this pass.
    pub is_master: bool,
    /// Messages readdressed to the running node.
    pub redirected: usize,
    /// Messages dropped with their evicted addressee.
    pub dropped_messages: usize,
    /// Change records pruned.
    pub pruned: usize,
}

/// Runs one cleanup pass on behalf of node `me`.
///
/// # Errors
///
/// Returns `SelfEvicted` if `me` is no longer registered, or the
/// store-closed family if the handle was closed.
pub fn run(
    db: &Database,
    me: NodeId,
    now_ms: u64,
    config: &ObserveConfig,
) -> ObserveResult<CleanupReport> {
    let timeout = duration_ms(config.node_timeout);
    let grace = duration_ms(config.grace_period);

    let report = db.transaction(&[NODES_TABLE, CHANGES_TABLE, INTERCOMM_TABLE], |txn| {
        match node::load(txn, me)? {
            None => return Ok(None),
            Some(mine) if mine.is_dying() => return Ok(Some(CleanupReport::default())),
            Some(_) => {}
        }
        let mut report = CleanupReport::default();
        let mut took_over = false;

        for mut peer in node::all(txn)? {
            if peer.id == me || peer.kind != NodeKind::Local {
                continue;
            }
            match peer.liveness(now_ms, timeout) {
                NodeLiveness::Alive | NodeLiveness::Suspect { delete_at: Some(_) } => {}
                NodeLiveness::Suspect { delete_at: None } => {
                    peer.delete_timestamp = Some(now_ms.saturating_add(grace));
                    node::store(txn, &peer)?;
                    report.marked.push(peer.id);
                }
                NodeLiveness::Expired => {
                    node::remove(txn, peer.id)?;
                    if peer.is_master {
                        if let Some(mut mine) = node::load(txn, me)? {
                            mine.is_master = true;
                            node::store(txn, &mine)?;
                            took_over = true;
                        }
                    }
                    let (redirected, dropped) = intercomm::redirect(txn, peer.id, me)?;
                    report.redirected += redirected;
                    report.dropped_messages += dropped;
                    report.evicted.push(peer.id);
                }
            }
        }

        let Some(election) = node::elect(txn, me, now_ms, timeout)? else {
            return Ok(None);
        };
        report.is_master = election.master == me;
        report.became_master = report.is_master && (took_over || election.promoted);
        report.demoted = election.demoted;

        let floor = node::all(txn)?.iter().map(|n| n.my_revision).min();
        if let Some(floor) = floor {
            report.pruned = changes::prune_before(txn, floor)?;
        }
        Ok(Some(report))
    })?;

    let report = report.ok_or(ObserveError::SelfEvicted { node: me })?;
    if !report.evicted.is_empty() || !report.marked.is_empty() || report.became_master {
        tracing::debug!(
            db = %db.name(),
            node = %me,
            evicted = ?report.evicted,
            marked = ?report.marked,
            became_master = report.became_master,
            "cleanup pass"
        );
    }
    Ok(report)
}
