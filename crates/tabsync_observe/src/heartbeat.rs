//! Heartbeat.
//!
//! A heartbeat touches only the registry table, so it never waits for a
//! transaction that holds the change log. Once the owner's stop flag is set
//! a heartbeat writes nothing, so a record marked dead stays dead.

use crate::clock::Clock;
use crate::error::{ObserveError, ObserveResult};
use crate::node::{self, SyncNode, NODES_TABLE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tabsync_core::{Database, NodeId};

/// Refreshes one node's liveness record.
pub struct Heartbeat {
    db: Arc<Database>,
    node: NodeId,
    clock: Arc<dyn Clock>,
    stopped: Arc<AtomicBool>,
}

impl Heartbeat {
    /// Creates a heartbeat for `node`.
    pub fn new(db: Arc<Database>, node: NodeId, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            node,
            clock,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shares the owner's stop flag.
    #[must_use]
    pub fn with_stop_flag(mut self, stopped: Arc<AtomicBool>) -> Self {
        self.stopped = stopped;
        self
    }

    /// Writes one heartbeat.
    ///
    /// # Errors
    ///
    /// Returns `SelfEvicted` if the node's record is gone, `Cancelled` once
    /// the stop flag is set, or the store-closed family if the handle was
    /// closed.
    pub fn beat(&self) -> ObserveResult<SyncNode> {
        let now = self.clock.now_ms();
        let touched = self.db.transaction(&[NODES_TABLE], |txn| {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(Err(ObserveError::Cancelled));
            }
            Ok(Ok(node::touch(txn, self.node, now)?))
        })??;
        match touched {
            Some(record) => {
                tracing::trace!(db = %self.db.name(), node = %self.node, "heartbeat");
                Ok(record)
            }
            None => Err(ObserveError::SelfEvicted { node: self.node }),
        }
    }
}
