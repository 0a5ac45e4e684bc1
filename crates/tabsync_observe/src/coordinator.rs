//! The per-store coordinator.
//!
//! A [`Coordinator`] owns everything one instance needs to take part in a
//! shared store: its registry record, the heartbeat, the change reader, the
//! mailbox, the notifier subscription and the background loops. Hosts either
//! call [`Coordinator::start`] to run the loops on the current tokio runtime,
//! or call [`Coordinator::attach`] and drive [`Coordinator::poll_once`]
//! themselves.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tabsync_core::{tracked, Database};
//! use tabsync_observe::{Coordinator, LocalNotifier, ObserveConfig};
//! use tabsync_storage::Value;
//!
//! let db = Arc::new(Database::open_in_memory());
//! let coordinator =
//!     Coordinator::new(db, ObserveConfig::default(), Arc::new(LocalNotifier::new())).unwrap();
//! let changes = coordinator.subscribe_changes();
//! coordinator.attach().unwrap();
//!
//! coordinator
//!     .transaction(Some("editor"), &["notes"], |txn| {
//!         tracked::create(txn, "notes", None, Value::from("hello"))
//!     })
//!     .unwrap();
//! coordinator.poll_once().unwrap();
//!
//! let batch = changes.try_recv().unwrap();
//! assert_eq!(batch.changes.len(), 1);
//! assert_eq!(batch.changes[0].source.as_deref(), Some("editor"));
//! ```

use crate::cleanup::{self, CleanupReport};
use crate::clock::{Clock, SystemClock};
use crate::config::ObserveConfig;
use crate::error::{ObserveError, ObserveResult};
use crate::feed::{ChangeBatch, Feed, LifecycleEvent};
use crate::heartbeat::Heartbeat;
use crate::intercomm::{ConsumeReport, IntercommMessage, Mailbox, ReplyHandle};
use crate::node::{self, RemoteNodeState, SyncNode, NODES_TABLE};
use crate::notifier::{Notifier, Signal};
use crate::reader::{ChangeReader, ReadSummary};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tabsync_core::{
    changes, CoreResult, Database, NodeId, Revision, Transaction, CHANGES_TABLE,
};
use tabsync_storage::Value;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;

struct Attached {
    node: NodeId,
    reader: ChangeReader,
    heartbeat: Heartbeat,
}

struct Inner {
    db: Arc<Database>,
    config: ObserveConfig,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    changes: Arc<Feed<ChangeBatch>>,
    events: Feed<LifecycleEvent>,
    latest_known: Arc<AtomicU64>,
    handled_revision: AtomicU64,
    activity: AtomicBool,
    wake: Notify,
    attached: RwLock<Option<Arc<Attached>>>,
    mailbox: Mailbox,
    stopped: Arc<AtomicBool>,
    is_master: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Coordinates one instance's participation in a shared store.
///
/// Cloning is cheap; clones share the same instance.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Creates a coordinator using the system clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(
        db: Arc<Database>,
        config: ObserveConfig,
        notifier: Arc<dyn Notifier>,
    ) -> ObserveResult<Self> {
        Self::with_clock(db, config, notifier, Arc::new(SystemClock))
    }

    /// Creates a coordinator with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn with_clock(
        db: Arc<Database>,
        config: ObserveConfig,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> ObserveResult<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        let mailbox = Mailbox::new(Arc::clone(&db), config.reply_timeout);
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                config,
                clock,
                notifier,
                changes: Arc::new(Feed::new()),
                events: Feed::new(),
                latest_known: Arc::new(AtomicU64::new(0)),
                handled_revision: AtomicU64::new(0),
                activity: AtomicBool::new(false),
                wake: Notify::new(),
                attached: RwLock::new(None),
                mailbox,
                stopped: Arc::new(AtomicBool::new(false)),
                is_master: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Returns the store handle.
    pub fn database(&self) -> &Arc<Database> {
        &self.inner.db
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ObserveConfig {
        &self.inner.config
    }

    /// Returns this instance's node id, once attached.
    pub fn node_id(&self) -> Option<NodeId> {
        self.inner.attached.read().as_ref().map(|a| a.node)
    }

    /// Returns true if this instance believes it is master.
    ///
    /// The flag reflects the last election this instance took part in. Use
    /// [`Coordinator::verify_master`] before a master-only action.
    pub fn is_master(&self) -> bool {
        self.inner.is_master.load(Ordering::SeqCst)
    }

    /// Returns true once the coordinator stopped or was evicted.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Returns the newest revision this instance knows to exist.
    pub fn latest_known_revision(&self) -> Revision {
        Revision::new(self.inner.latest_known.load(Ordering::SeqCst))
    }

    /// Subscribes to delivered change batches.
    pub fn subscribe_changes(&self) -> Receiver<ChangeBatch> {
        self.inner.changes.subscribe()
    }

    /// Registers a callback for delivered change batches.
    ///
    /// The callback runs on the reading thread with no table locked. It may
    /// open transactions or stop the coordinator.
    pub fn on_changes(&self, listener: impl Fn(&ChangeBatch) + Send + Sync + 'static) {
        self.inner.changes.listen(listener);
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_events(&self) -> Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Registers the handler for intercomm messages of `message_type`.
    pub fn on_message(
        &self,
        message_type: impl Into<String>,
        handler: impl Fn(&IntercommMessage) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        self.inner.mailbox.on_message(message_type, handler);
    }

    /// Registers this instance as a node and runs the initial election.
    ///
    /// The node starts at the newest revision in the store, so it only sees
    /// changes committed after it joined. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` after `stop`, or a store error.
    pub fn attach(&self) -> ObserveResult<NodeId> {
        if self.is_stopped() {
            return Err(ObserveError::Cancelled);
        }
        let inner = &self.inner;
        let mut slot = inner.attached.write();
        if let Some(attached) = slot.as_ref() {
            return Ok(attached.node);
        }

        let now = inner.clock.now_ms();
        let timeout = crate::clock::duration_ms(inner.config.node_timeout);
        let (node, latest, election) =
            inner
                .db
                .transaction(&[CHANGES_TABLE, NODES_TABLE], |txn| {
                    let latest = changes::latest_revision(txn)?;
                    let node = node::insert_local(txn, latest, now)?;
                    let election = node::elect(txn, node, now, timeout)?;
                    Ok((node, latest, election))
                })?;

        inner.latest_known.fetch_max(latest.as_u64(), Ordering::SeqCst);
        inner
            .handled_revision
            .fetch_max(latest.as_u64(), Ordering::SeqCst);
        *slot = Some(Arc::new(Attached {
            node,
            reader: ChangeReader::new(
                Arc::clone(&inner.db),
                node,
                Arc::clone(&inner.clock),
                inner.config.batch_limit,
                Arc::clone(&inner.changes),
                Arc::clone(&inner.latest_known),
            )
            .with_stop_flag(Arc::clone(&inner.stopped)),
            heartbeat: Heartbeat::new(Arc::clone(&inner.db), node, Arc::clone(&inner.clock))
                .with_stop_flag(Arc::clone(&inner.stopped)),
        }));
        drop(slot);

        let is_master = election.is_some_and(|e| e.master == node);
        inner.is_master.store(is_master, Ordering::SeqCst);
        tracing::info!(
            db = %inner.db.name(),
            node = %node,
            revision = %latest,
            is_master,
            "node registered"
        );
        Ok(node)
    }

    fn attached(&self) -> ObserveResult<Arc<Attached>> {
        self.inner
            .attached
            .read()
            .clone()
            .ok_or(ObserveError::NotAttached)
    }

    /// Attaches and spawns the heartbeat, poll and notification loops on
    /// the current tokio runtime, then runs one cleanup pass.
    ///
    /// Calling `start` again only returns the node id.
    ///
    /// # Errors
    ///
    /// Returns an error if attaching fails or the initial cleanup finds this
    /// node evicted.
    pub async fn start(&self) -> ObserveResult<NodeId> {
        let this = self.clone();
        let node = tokio::task::spawn_blocking(move || this.attach())
            .await
            .map_err(|_| ObserveError::Cancelled)??;

        {
            let mut tasks = self.inner.tasks.lock();
            if !tasks.is_empty() {
                return Ok(node);
            }
            let signals = self.inner.notifier.subscribe();
            tasks.push(tokio::spawn(heartbeat_loop(self.clone())));
            tasks.push(tokio::spawn(poll_loop(self.clone())));
            tasks.push(tokio::spawn(signal_loop(self.clone(), signals)));
        }

        let this = self.clone();
        let initial = tokio::task::spawn_blocking(move || this.poll_once())
            .await
            .map_err(|_| ObserveError::Cancelled)?;
        initial?;
        Ok(node)
    }

    /// Runs one poll cycle: read changes, clean up, consume intercomm.
    ///
    /// Store-closed errors are swallowed.
    ///
    /// # Errors
    ///
    /// Returns `SelfEvicted` (after tearing down) if a peer evicted this
    /// node, or `NotAttached` before `attach`.
    pub fn poll_once(&self) -> ObserveResult<()> {
        let result = self
            .read_changes()
            .and_then(|_| self.cleanup())
            .and_then(|_| self.consume_messages());
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_closed() => {
                tracing::debug!(db = %self.inner.db.name(), error = %e, "poll skipped on closed store");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Reads and delivers new changes.
    ///
    /// # Errors
    ///
    /// See [`ChangeReader::read_changes`].
    pub fn read_changes(&self) -> ObserveResult<ReadSummary> {
        let attached = self.attached()?;
        self.guard(attached.reader.read_changes())
    }

    /// Writes one heartbeat.
    ///
    /// # Errors
    ///
    /// See [`Heartbeat::beat`].
    pub fn heartbeat(&self) -> ObserveResult<SyncNode> {
        let attached = self.attached()?;
        self.guard(attached.heartbeat.beat())
    }

    /// Runs one cleanup pass and publishes its outcome.
    ///
    /// # Errors
    ///
    /// See [`cleanup::run`].
    pub fn cleanup(&self) -> ObserveResult<CleanupReport> {
        let attached = self.attached()?;
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let report = self.guard(cleanup::run(&inner.db, attached.node, now, &inner.config))?;

        for evicted in &report.evicted {
            inner.notifier.forget_node(inner.db.name(), *evicted);
        }
        self.record_mastership(report.is_master);
        inner.events.emit(&LifecycleEvent::Cleanup {
            became_master: report.became_master,
        });
        Ok(report)
    }

    /// Processes intercomm messages addressed to this node.
    ///
    /// # Errors
    ///
    /// See [`Mailbox::consume`].
    pub fn consume_messages(&self) -> ObserveResult<ConsumeReport> {
        let attached = self.attached()?;
        let report = self.guard(self.inner.mailbox.consume(attached.node))?;
        for destination in &report.replied_to {
            self.publish_intercomm(*destination);
        }
        Ok(report)
    }

    /// Sends an intercomm message to `destination`.
    ///
    /// # Errors
    ///
    /// Returns `NotAttached` before `attach`, or a store error.
    pub fn send_message(
        &self,
        destination: NodeId,
        message_type: &str,
        payload: Value,
        want_reply: bool,
    ) -> ObserveResult<Option<ReplyHandle>> {
        let attached = self.attached()?;
        let handle = self.inner.mailbox.send(
            attached.node,
            destination,
            message_type,
            payload,
            want_reply,
        )?;
        self.publish_intercomm(destination);
        Ok(handle)
    }

    /// Sends a message to every other local node, and to this node as well
    /// when `include_self` is set. Returns the addressees.
    ///
    /// # Errors
    ///
    /// Returns `NotAttached` before `attach`, or a store error.
    pub fn broadcast_message(
        &self,
        message_type: &str,
        payload: &Value,
        include_self: bool,
    ) -> ObserveResult<Vec<NodeId>> {
        let attached = self.attached()?;
        let addressees =
            self.inner
                .mailbox
                .broadcast(attached.node, message_type, payload, include_self)?;
        for destination in &addressees {
            self.publish_intercomm(*destination);
        }
        Ok(addressees)
    }

    /// Returns the number of sent requests still waiting for a reply.
    pub fn pending_replies(&self) -> usize {
        self.inner.mailbox.pending_replies()
    }

    /// Runs tracked mutations in one transaction.
    ///
    /// The change log is always part of the scope. Change records appended
    /// by `f` are stamped with `source`. On commit, the new revision is
    /// announced to peers and wakes this instance's poll loop.
    ///
    /// # Errors
    ///
    /// Returns the error of `f` (after rolling back) or a store error.
    pub fn transaction<F, T>(&self, source: Option<&str>, scope: &[&str], f: F) -> ObserveResult<T>
    where
        F: FnOnce(&mut Transaction<'_, '_>) -> CoreResult<T>,
    {
        let inner = &self.inner;
        let mut tables: Vec<&str> = scope.to_vec();
        if !tables.contains(&CHANGES_TABLE) {
            tables.push(CHANGES_TABLE);
        }

        let (value, revision) = inner.db.transaction(&tables, |txn| {
            txn.set_source(source.map(str::to_string));
            let value = f(txn)?;
            Ok((value, txn.last_revision()))
        })?;

        if let Some(revision) = revision {
            inner
                .latest_known
                .fetch_max(revision.as_u64(), Ordering::SeqCst);
            inner.activity.store(true, Ordering::SeqCst);
            inner.wake.notify_one();
            inner.notifier.publish(Signal::Revision {
                db: inner.db.name().to_string(),
                revision,
            });
        }
        Ok(value)
    }

    /// Registers a remote sync endpoint in the node registry.
    ///
    /// The endpoint starts at the newest revision this instance knows of.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn register_remote(&self, state: RemoteNodeState) -> ObserveResult<NodeId> {
        let now = self.inner.clock.now_ms();
        let revision = self.latest_known_revision();
        let id = self.inner.db.transaction(&[NODES_TABLE], |txn| {
            node::register_remote(txn, state, revision, now)
        })?;
        tracing::debug!(db = %self.inner.db.name(), node = %id, "remote node registered");
        Ok(id)
    }

    /// Updates the remote state of node `id`. Returns false if `id` is not
    /// a registered remote node.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub fn update_remote(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut RemoteNodeState),
    ) -> ObserveResult<bool> {
        Ok(self
            .inner
            .db
            .transaction(&[NODES_TABLE], |txn| node::update_remote(txn, id, f))?)
    }

    /// Re-reads this node's record and reports whether it is still master.
    ///
    /// Call immediately before a master-only action; a node that stalled
    /// past its timeout may have been replaced without noticing.
    ///
    /// # Errors
    ///
    /// Returns `SelfEvicted` (after tearing down) if the record is gone.
    pub fn verify_master(&self) -> ObserveResult<bool> {
        let attached = self.attached()?;
        let record = self
            .inner
            .db
            .transaction(&[NODES_TABLE], |txn| node::load(txn, attached.node))
            .map_err(ObserveError::from);
        let record = self.guard(record.and_then(|r| {
            r.ok_or(ObserveError::SelfEvicted {
                node: attached.node,
            })
        }))?;
        self.record_mastership(record.is_master);
        Ok(record.is_master)
    }

    /// Reacts to one notification.
    ///
    /// Revision signals already covered are ignored. Signals for other
    /// stores are ignored.
    ///
    /// # Errors
    ///
    /// Returns the error of the triggered read, cleanup or consume.
    pub fn handle_signal(&self, signal: &Signal) -> ObserveResult<()> {
        let inner = &self.inner;
        if signal.db() != inner.db.name() || self.is_stopped() {
            return Ok(());
        }
        let Some(me) = self.node_id() else {
            return Ok(());
        };
        let result = match signal {
            Signal::Revision { revision, .. } => {
                let rev = revision.as_u64();
                inner.latest_known.fetch_max(rev, Ordering::SeqCst);
                if inner.handled_revision.fetch_max(rev, Ordering::SeqCst) >= rev {
                    return Ok(());
                }
                self.read_changes().map(|_| ())
            }
            Signal::Dying { node, .. } if *node != me => self.retire(*node),
            Signal::Intercomm { destination, .. } if *destination == me => {
                self.consume_messages().map(|_| ())
            }
            _ => Ok(()),
        };
        match result {
            Err(e) if e.is_closed() => Ok(()),
            other => other,
        }
    }

    /// Marks a peer that announced its shutdown as dead, then cleans up.
    ///
    /// The peer may have failed to mark itself, so its record is not trusted
    /// to be dead already.
    fn retire(&self, peer: NodeId) -> ObserveResult<()> {
        let marked = self
            .inner
            .db
            .transaction(&[NODES_TABLE], |txn| node::mark_dead(txn, peer))?;
        if marked {
            tracing::debug!(db = %self.inner.db.name(), node = %peer, "peer announced shutdown");
        }
        self.cleanup().map(|_| ())
    }

    /// Stops the coordinator. Idempotent.
    ///
    /// Marks this node dead so peers evict it on their next cleanup,
    /// announces it, stops the loops, closes the store handle and emits
    /// [`LifecycleEvent::Stopped`].
    ///
    /// The stop flag is raised before the node is marked dead, and heartbeats
    /// and change reads check it under the registry lock, so no write from
    /// this instance revives the record afterwards. `stop` may be called from
    /// a change or message listener; the running poll then ends quietly.
    pub fn stop(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(node) = self.node_id() {
            let marked = inner
                .db
                .transaction(&[NODES_TABLE], |txn| node::mark_dead(txn, node));
            if let Err(e) = marked {
                if !e.is_closed() {
                    tracing::warn!(db = %inner.db.name(), node = %node, error = %e, "failed to mark node dead");
                }
            }
            inner.notifier.publish(Signal::Dying {
                db: inner.db.name().to_string(),
                node,
            });
            tracing::info!(db = %inner.db.name(), node = %node, "node stopped");
        }
        self.teardown();
        inner.events.emit(&LifecycleEvent::Stopped);
    }

    fn teardown(&self) {
        let inner = &self.inner;
        inner.is_master.store(false, Ordering::SeqCst);
        let _ = inner.shutdown.send(true);
        inner.wake.notify_one();
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        inner.db.close();
    }

    /// Tears down on self-eviction and passes the result through.
    fn guard<T>(&self, result: ObserveResult<T>) -> ObserveResult<T> {
        if let Err(ObserveError::SelfEvicted { node }) = &result {
            if !self.inner.stopped.swap(true, Ordering::SeqCst) {
                tracing::warn!(db = %self.inner.db.name(), node = %node, "evicted by a peer, tearing down");
                self.teardown();
                self.inner.events.emit(&LifecycleEvent::Evicted);
            }
        }
        result
    }

    fn record_mastership(&self, is_master: bool) {
        let was = self.inner.is_master.swap(is_master, Ordering::SeqCst);
        if was != is_master {
            tracing::info!(
                db = %self.inner.db.name(),
                node = ?self.node_id(),
                is_master,
                "mastership changed"
            );
        }
    }

    fn publish_intercomm(&self, destination: NodeId) {
        self.inner.notifier.publish(Signal::Intercomm {
            db: self.inner.db.name().to_string(),
            destination,
        });
    }

    fn next_poll_delay(&self) -> Duration {
        let config = &self.inner.config;
        if let Some(hibernate) = config.hibernate_interval() {
            if !self.inner.activity.swap(false, Ordering::SeqCst) {
                return hibernate;
            }
        }
        let jitter = rand::thread_rng().gen_range(0.0..=config.poll_jitter);
        config.poll_interval.mul_f64(1.0 + jitter)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("db", &self.inner.db.name())
            .field("node", &self.node_id())
            .field("is_master", &self.is_master())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Runs `f` on the blocking pool. Returns false if the loop should end.
async fn run_blocking<T: Send + 'static>(
    coordinator: &Coordinator,
    what: &'static str,
    f: impl FnOnce(&Coordinator) -> ObserveResult<T> + Send + 'static,
) -> bool {
    let this = coordinator.clone();
    let outcome = tokio::task::spawn_blocking(move || f(&this)).await;
    match outcome {
        Ok(Ok(_)) => true,
        Ok(Err(ObserveError::SelfEvicted { .. })) => false,
        Ok(Err(e)) if e.is_closed() => !coordinator.is_stopped(),
        Ok(Err(e)) => {
            tracing::warn!(db = %coordinator.inner.db.name(), error = %e, "{what} failed");
            true
        }
        Err(_) => false,
    }
}

async fn heartbeat_loop(coordinator: Coordinator) {
    let mut shutdown = coordinator.inner.shutdown.subscribe();
    let interval = coordinator.inner.config.heartbeat_interval;
    while !coordinator.is_stopped() {
        tokio::select! {
            _ = shutdown.changed() => break,
            () = tokio::time::sleep(interval) => {}
        }
        if !run_blocking(&coordinator, "heartbeat", Coordinator::heartbeat).await {
            break;
        }
    }
}

async fn poll_loop(coordinator: Coordinator) {
    let mut shutdown = coordinator.inner.shutdown.subscribe();
    while !coordinator.is_stopped() {
        let delay = coordinator.next_poll_delay();
        tokio::select! {
            _ = shutdown.changed() => break,
            () = coordinator.inner.wake.notified() => {}
            () = tokio::time::sleep(delay) => {}
        }
        if coordinator.is_stopped() {
            break;
        }
        if !run_blocking(&coordinator, "poll", Coordinator::poll_once).await {
            break;
        }
    }
}

async fn signal_loop(coordinator: Coordinator, mut signals: broadcast::Receiver<Signal>) {
    let mut shutdown = coordinator.inner.shutdown.subscribe();
    while !coordinator.is_stopped() {
        let signal = tokio::select! {
            _ = shutdown.changed() => break,
            received = signals.recv() => received,
        };
        match signal {
            Ok(signal) => {
                let ok = run_blocking(&coordinator, "signal handling", move |c| {
                    c.handle_signal(&signal)
                })
                .await;
                if !ok {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(db = %coordinator.inner.db.name(), skipped, "signals lagged");
                coordinator.inner.wake.notify_one();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
