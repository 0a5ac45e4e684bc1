//! Simulated multi-instance cluster.
//!
//! A [`Cluster`] runs several coordinators against one in-memory store, as
//! separate browser tabs or processes would against a shared database. Time
//! comes from a [`MockClock`] and nothing runs in the background: tests step
//! the cluster explicitly with [`Cluster::tick`] or drive single instances,
//! so every interleaving is reproducible.

use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tabsync_core::{changes, tracked, ChangeRecord, Database, NodeId, Revision, CHANGES_TABLE};
use tabsync_observe::{
    node, ChangeBatch, Coordinator, LifecycleEvent, LocalNotifier, MockClock, ObserveConfig,
    ObserveError, SyncNode, NODES_TABLE,
};
use tabsync_storage::{InMemoryBackend, Value};

/// Store name shared by every cluster instance.
pub const CLUSTER_DB: &str = "cluster";

/// Initial mock clock reading, epoch milliseconds.
pub const CLUSTER_EPOCH_MS: u64 = 1_000_000;

/// One simulated instance.
pub struct Instance {
    /// The instance's coordinator.
    pub coordinator: Coordinator,
    changes: Receiver<ChangeBatch>,
    events: Receiver<LifecycleEvent>,
    hung: bool,
}

impl Instance {
    /// Returns the instance's node id.
    pub fn node_id(&self) -> NodeId {
        self.coordinator
            .node_id()
            .expect("cluster instances are attached on spawn")
    }

    /// Returns true if the instance was hung with [`Cluster::hang`].
    pub fn is_hung(&self) -> bool {
        self.hung
    }

    /// Takes every change batch delivered since the last call.
    pub fn drain_batches(&self) -> Vec<ChangeBatch> {
        self.changes.try_iter().collect()
    }

    /// Takes every change record delivered since the last call.
    pub fn drain_changes(&self) -> Vec<ChangeRecord> {
        self.drain_batches()
            .into_iter()
            .flat_map(|b| b.changes)
            .collect()
    }

    /// Takes every lifecycle event emitted since the last call.
    pub fn drain_events(&self) -> Vec<LifecycleEvent> {
        self.events.try_iter().collect()
    }
}

/// Several coordinators sharing one store, clock and notifier.
pub struct Cluster {
    backend: Arc<InMemoryBackend>,
    clock: Arc<MockClock>,
    notifier: Arc<LocalNotifier>,
    config: ObserveConfig,
    observer: Database,
    instances: Vec<Instance>,
}

impl Cluster {
    /// Creates a cluster of `n` attached instances with the default
    /// configuration.
    pub fn new(n: usize) -> Self {
        Self::with_config(n, ObserveConfig::default())
    }

    /// Creates a cluster of `n` attached instances.
    pub fn with_config(n: usize, config: ObserveConfig) -> Self {
        let backend = Arc::new(InMemoryBackend::new());
        let mut cluster = Self {
            observer: Database::open_shared(CLUSTER_DB, backend.clone()),
            backend,
            clock: Arc::new(MockClock::new(CLUSTER_EPOCH_MS)),
            notifier: Arc::new(LocalNotifier::new()),
            config,
            instances: Vec::with_capacity(n),
        };
        for _ in 0..n {
            cluster.spawn();
        }
        cluster
    }

    /// Creates, subscribes and attaches a new instance. Returns its index.
    pub fn spawn(&mut self) -> usize {
        let coordinator = self.coordinator();
        let changes = coordinator.subscribe_changes();
        let events = coordinator.subscribe_events();
        coordinator.attach().expect("attach failed");
        self.instances.push(Instance {
            coordinator,
            changes,
            events,
            hung: false,
        });
        self.instances.len() - 1
    }

    /// Creates a coordinator on the cluster store without attaching it.
    pub fn coordinator(&self) -> Coordinator {
        Coordinator::with_clock(
            Arc::new(Database::open_shared(CLUSTER_DB, self.backend.clone())),
            self.config.clone(),
            self.notifier.clone(),
            self.clock.clone(),
        )
        .expect("invalid cluster configuration")
    }

    /// Returns instance `i`.
    pub fn instance(&self, i: usize) -> &Instance {
        &self.instances[i]
    }

    /// Returns every instance.
    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Returns the shared clock.
    pub fn clock(&self) -> &Arc<MockClock> {
        &self.clock
    }

    /// Returns the shared notifier.
    pub fn notifier(&self) -> &Arc<LocalNotifier> {
        &self.notifier
    }

    /// Returns the configuration every instance runs with.
    pub fn config(&self) -> &ObserveConfig {
        &self.config
    }

    /// Returns a handle on the store that is not registered as a node.
    pub fn database(&self) -> &Database {
        &self.observer
    }

    /// Moves the shared clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Writes one heartbeat for every running, non-hung instance.
    pub fn heartbeat_all(&self) {
        for instance in self.active() {
            let _ = instance.coordinator.heartbeat();
        }
    }

    /// Runs one poll cycle on every running, non-hung instance.
    ///
    /// Returns the nodes that found themselves evicted.
    pub fn poll_all(&self) -> Vec<NodeId> {
        let mut evicted = Vec::new();
        for instance in self.active() {
            if let Err(ObserveError::SelfEvicted { node }) = instance.coordinator.poll_once() {
                evicted.push(node);
            }
        }
        evicted
    }

    /// Advances the clock, then heartbeats and polls every active instance.
    pub fn tick(&self, by: Duration) -> Vec<NodeId> {
        self.advance(by);
        self.heartbeat_all();
        self.poll_all()
    }

    /// Stops heartbeats and polls of instance `i` without telling anyone.
    pub fn hang(&mut self, i: usize) {
        self.instances[i].hung = true;
    }

    /// Resumes a hung instance.
    pub fn resume(&mut self, i: usize) {
        self.instances[i].hung = false;
    }

    /// Hangs instance `i` and backdates its heartbeat to
    /// `now - 2 × node_timeout`, as if it had stalled that long.
    pub fn stall(&mut self, i: usize) {
        self.hang(i);
        let id = self.instances[i].node_id();
        let timeout = u64::try_from(self.config.node_timeout.as_millis()).unwrap_or(u64::MAX);
        let backdated = self.now_ms().saturating_sub(timeout.saturating_mul(2));
        self.observer
            .transaction(&[NODES_TABLE], |txn| {
                if let Some(mut record) = node::load(txn, id)? {
                    record.last_heartbeat = backdated;
                    node::store(txn, &record)?;
                }
                Ok(())
            })
            .expect("stall failed");
    }

    /// Stops instance `i` gracefully.
    pub fn stop(&self, i: usize) {
        self.instances[i].coordinator.stop();
    }

    /// Returns the current mock time.
    pub fn now_ms(&self) -> u64 {
        use tabsync_observe::Clock;
        self.clock.now_ms()
    }

    /// Writes `count` new rows to `table` from instance `i`.
    ///
    /// Returns the revision of the last row.
    pub fn write(&self, i: usize, table: &str, count: usize) -> Revision {
        self.instances[i]
            .coordinator
            .transaction(Some("testkit"), &[table], |txn| {
                let mut last = Revision::ZERO;
                for n in 0..count {
                    let n = i64::try_from(n).unwrap_or(i64::MAX);
                    let row = Value::object([("n", Value::Integer(n))]);
                    last = tracked::create(txn, table, None, row)?.1;
                }
                Ok(last)
            })
            .expect("write failed")
    }

    /// Returns every registry record.
    pub fn registry(&self) -> Vec<SyncNode> {
        self.observer
            .transaction(&[NODES_TABLE], |txn| node::all(txn))
            .expect("registry read failed")
    }

    /// Returns the registry record of node `id`.
    pub fn record(&self, id: NodeId) -> Option<SyncNode> {
        self.observer
            .transaction(&[NODES_TABLE], |txn| node::load(txn, id))
            .expect("registry read failed")
    }

    /// Returns the ids of every record flagged master.
    pub fn masters(&self) -> Vec<NodeId> {
        self.registry()
            .into_iter()
            .filter(|n| n.is_master)
            .map(|n| n.id)
            .collect()
    }

    /// Returns the number of change records in the log.
    pub fn change_count(&self) -> usize {
        self.observer
            .transaction(&[CHANGES_TABLE], |txn| changes::count(txn))
            .expect("change log read failed")
    }

    fn active(&self) -> impl Iterator<Item = &Instance> {
        self.instances
            .iter()
            .filter(|i| !i.hung && !i.coordinator.is_stopped())
    }
}
