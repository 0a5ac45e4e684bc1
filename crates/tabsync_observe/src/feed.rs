//! Event feeds for change batches and lifecycle events.
//!
//! A [`Feed`] fans events out to channel subscribers and to registered
//! listeners. Change batches are published by the reader with no table
//! locked. An instance runs one read at a time, so listeners observe its
//! batches in commit order.

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use tabsync_core::ChangeRecord;

/// One delivered batch of change records.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    /// Records in increasing revision order.
    pub changes: Vec<ChangeRecord>,
    /// True if more records follow in the next batch.
    pub partial: bool,
}

/// Lifecycle notifications of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A cleanup pass finished.
    Cleanup {
        /// True if this node was promoted to master by the pass.
        became_master: bool,
    },
    /// The coordinator stopped on request.
    Stopped,
    /// A peer evicted this node; the host should reinitialise.
    Evicted,
}

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A multi-subscriber event feed.
pub struct Feed<E> {
    subscribers: RwLock<Vec<Sender<E>>>,
    listeners: RwLock<Vec<Listener<E>>>,
}

impl<E: Clone> Feed<E> {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to the feed.
    ///
    /// Returns a receiver that will receive all future events. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<E> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Registers a callback invoked synchronously for every event.
    pub fn listen(&self, listener: impl Fn(&E) + Send + Sync + 'static) {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Emits an event to all subscribers and listeners.
    pub fn emit(&self, event: &E) {
        let listeners: Vec<Listener<E>> = self.listeners.read().clone();
        for listener in listeners {
            listener(event);
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of channel subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<E: Clone> Default for Feed<E> {
    fn default() -> Self {
        Self::new()
    }
}
