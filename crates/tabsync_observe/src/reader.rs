//! The change reader.
//!
//! Pulls change records newer than the node's `my_revision` in bounded
//! batches and delivers them to the change feed. Each step reads the batch
//! in a change-log-only transaction, delivers it with no table locked, then
//! advances `my_revision`, refreshes the heartbeat and clears any deletion
//! mark in one registry-only transaction. Slow listeners therefore never hold
//! the registry, and `my_revision` only moves forward.
//!
//! Listeners may open transactions of their own, and may stop the owning
//! coordinator.

use crate::clock::Clock;
use crate::error::{ObserveError, ObserveResult};
use crate::feed::{ChangeBatch, Feed};
use crate::node::{self, NODES_TABLE};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tabsync_core::{changes, CoreError, Database, NodeId, Revision, CHANGES_TABLE};

/// Outcome of one `read_changes` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSummary {
    /// Number of batches delivered.
    pub batches: usize,
    /// Number of change records delivered.
    pub delivered: usize,
    /// The node's revision after reading.
    pub my_revision: Revision,
}

type Shared = Result<ReadSummary, ObserveError>;

#[derive(Default)]
struct Flight {
    result: Mutex<Option<Shared>>,
    done: Condvar,
    joined: AtomicUsize,
}

impl Flight {
    fn finish(&self, result: Shared) {
        *self.result.lock() = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> Shared {
        let mut result = self.result.lock();
        while result.is_none() {
            self.done.wait(&mut result);
        }
        match result.as_ref() {
            Some(Ok(summary)) => Ok(summary.clone()),
            Some(Err(e)) => Err(share_error(e)),
            None => Err(ObserveError::Cancelled),
        }
    }
}

/// Rebuilds an error for a caller that joined an in-flight read.
fn share_error(e: &ObserveError) -> ObserveError {
    match e {
        ObserveError::SelfEvicted { node } => ObserveError::SelfEvicted { node: *node },
        ObserveError::Cancelled => ObserveError::Cancelled,
        e if e.is_closed() => ObserveError::Core(CoreError::DatabaseClosed),
        other => ObserveError::Core(CoreError::aborted(other.to_string())),
    }
}

/// Clears the in-flight slot when the leading read ends, including by
/// unwinding out of a panicking listener. Joined callers then get
/// `Cancelled` instead of waiting forever.
struct Landing<'a> {
    slot: &'a Mutex<Option<Arc<Flight>>>,
    flight: Arc<Flight>,
    result: Option<Shared>,
}

impl Drop for Landing<'_> {
    fn drop(&mut self) {
        *self.slot.lock() = None;
        self.flight
            .finish(self.result.take().unwrap_or(Err(ObserveError::Cancelled)));
    }
}

struct Step {
    delivered: usize,
    emitted: bool,
    partial: bool,
    my_revision: Revision,
    latest: Revision,
}

/// Reads the change log on behalf of one node.
pub struct ChangeReader {
    db: Arc<Database>,
    node: NodeId,
    clock: Arc<dyn Clock>,
    batch_limit: usize,
    feed: Arc<Feed<ChangeBatch>>,
    latest_known: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
    flight: Mutex<Option<Arc<Flight>>>,
}

impl ChangeReader {
    /// Creates a reader for `node`.
    ///
    /// `latest_known` is the owning coordinator's view of the newest
    /// revision in the store; the reader raises it and keeps reading while it
    /// is ahead of the node.
    pub fn new(
        db: Arc<Database>,
        node: NodeId,
        clock: Arc<dyn Clock>,
        batch_limit: usize,
        feed: Arc<Feed<ChangeBatch>>,
        latest_known: Arc<AtomicU64>,
    ) -> Self {
        Self {
            db,
            node,
            clock,
            batch_limit: batch_limit.max(1),
            feed,
            latest_known,
            stopped: Arc::new(AtomicBool::new(false)),
            flight: Mutex::new(None),
        }
    }

    /// Shares the owner's stop flag. Once it is set the reader no longer
    /// writes the node's record.
    #[must_use]
    pub fn with_stop_flag(mut self, stopped: Arc<AtomicBool>) -> Self {
        self.stopped = stopped;
        self
    }

    /// Returns true while a read is running.
    pub fn is_in_flight(&self) -> bool {
        self.flight.lock().is_some()
    }

    /// Returns how many callers are waiting on the running read.
    pub fn joined_callers(&self) -> usize {
        self.flight
            .lock()
            .as_ref()
            .map_or(0, |f| f.joined.load(Ordering::SeqCst))
    }

    /// Reads and delivers every change newer than the node's revision.
    ///
    /// A call made while another is running waits for it and returns its
    /// result instead of scanning the log again.
    ///
    /// # Errors
    ///
    /// Returns `SelfEvicted` if the node's record is gone, `Cancelled` once
    /// the stop flag is set, or the store-closed family if the handle was
    /// closed.
    pub fn read_changes(&self) -> ObserveResult<ReadSummary> {
        let (flight, leader) = {
            let mut slot = self.flight.lock();
            match slot.as_ref() {
                Some(flight) => (Arc::clone(flight), false),
                None => {
                    let flight = Arc::new(Flight::default());
                    *slot = Some(Arc::clone(&flight));
                    (flight, true)
                }
            }
        };
        if !leader {
            tracing::trace!(node = %self.node, "joining in-flight read");
            flight.joined.fetch_add(1, Ordering::SeqCst);
            return flight.wait();
        }

        let mut landing = Landing {
            slot: &self.flight,
            flight,
            result: None,
        };
        let result = self.catch_up();
        landing.result = Some(match &result {
            Ok(summary) => Ok(summary.clone()),
            Err(e) => Err(share_error(e)),
        });
        result
    }

    fn catch_up(&self) -> ObserveResult<ReadSummary> {
        let mut summary = ReadSummary::default();
        let mut was_partial = false;
        loop {
            let step = self.step(was_partial)?;
            summary.delivered += step.delivered;
            if step.emitted {
                summary.batches += 1;
            }
            summary.my_revision = step.my_revision;
            self.latest_known
                .fetch_max(step.latest.as_u64(), Ordering::SeqCst);

            let behind = self.latest_known.load(Ordering::SeqCst) > step.my_revision.as_u64();
            let progressed = step.delivered > 0;
            if step.partial || (behind && progressed) {
                was_partial = step.partial;
                continue;
            }
            break;
        }
        tracing::debug!(
            db = %self.db.name(),
            node = %self.node,
            revision = %summary.my_revision,
            batches = summary.batches,
            "changes read"
        );
        Ok(summary)
    }

    fn step(&self, was_partial: bool) -> ObserveResult<Step> {
        let limit = self.batch_limit;
        let since = self
            .db
            .transaction(&[NODES_TABLE], |txn| {
                Ok(node::load(txn, self.node)?.map(|me| me.my_revision))
            })?
            .ok_or(ObserveError::SelfEvicted { node: self.node })?;

        let (latest, records) = self.db.transaction(&[CHANGES_TABLE], |txn| {
            let latest = changes::latest_revision(txn)?;
            Ok((latest, changes::read_after(txn, since, limit)?))
        })?;
        let partial = records.len() == limit;
        let delivered = records.len();
        let read_up_to = records.last().map_or(since, |r| r.revision);

        let emitted = delivered > 0 || was_partial;
        if emitted {
            self.feed.emit(&ChangeBatch {
                changes: records,
                partial,
            });
        }

        let now = self.clock.now_ms();
        let my_revision = self.db.transaction(&[NODES_TABLE], |txn| {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(Err(ObserveError::Cancelled));
            }
            let Some(mut me) = node::load(txn, self.node)? else {
                return Ok(Err(ObserveError::SelfEvicted { node: self.node }));
            };
            me.my_revision = me.my_revision.max(read_up_to);
            me.last_heartbeat = now;
            me.delete_timestamp = None;
            node::store(txn, &me)?;
            Ok(Ok(me.my_revision))
        })??;

        Ok(Step {
            delivered,
            emitted,
            partial,
            my_revision,
            latest,
        })
    }
}
