//! Cross-instance notifications.
//!
//! Signals are a latency optimisation only: delivery and ordering are not
//! guaranteed, and every decision they trigger is also reached by the poll
//! loop. Receivers deduplicate by revision.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabsync_core::{NodeId, Revision};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// A best-effort notification between instances of one database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// A transaction committed up to `revision`.
    Revision {
        /// Database name.
        db: String,
        /// Highest committed revision.
        revision: Revision,
    },
    /// A node is shutting down and can be evicted immediately.
    Dying {
        /// Database name.
        db: String,
        /// The dying node.
        node: NodeId,
    },
    /// A mailbox row was written for `destination`.
    Intercomm {
        /// Database name.
        db: String,
        /// The addressee.
        destination: NodeId,
    },
}

impl Signal {
    /// Returns the database the signal belongs to.
    #[must_use]
    pub fn db(&self) -> &str {
        match self {
            Self::Revision { db, .. } | Self::Dying { db, .. } | Self::Intercomm { db, .. } => db,
        }
    }
}

/// Publish/subscribe channel between instances.
pub trait Notifier: Send + Sync {
    /// Publishes a signal. Never fails; undeliverable signals are dropped.
    fn publish(&self, signal: Signal);

    /// Subscribes to signals published from now on.
    fn subscribe(&self) -> broadcast::Receiver<Signal>;

    /// Drops any persistent trace of a node's dying signal.
    fn forget_node(&self, _db: &str, _node: NodeId) {}
}

/// In-process fan-out between instances sharing one process.
#[derive(Debug, Clone)]
pub struct LocalNotifier {
    tx: broadcast::Sender<Signal>,
}

impl LocalNotifier {
    /// Creates a notifier.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for LocalNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for LocalNotifier {
    fn publish(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }

    fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}

/// Cross-process notifier backed by a shared directory.
///
/// Each signal is a small key file whose content changes on every publish:
///
/// ```text
/// latest-revision.<db>        highest revision
/// deadnode.<node>.<db>        nonce
/// intercomm.<node>.<db>       nonce
/// ```
///
/// Keys are written to a dot-prefixed temp file and renamed into place. A
/// filesystem watcher turns created or changed keys into signals for local
/// subscribers; local publishes reach local subscribers directly. Watching
/// stops when the notifier is dropped.
pub struct SharedDirNotifier {
    dir: PathBuf,
    local: LocalNotifier,
    seen: Arc<Mutex<HashMap<String, String>>>,
    _watcher: Mutex<RecommendedWatcher>,
}

impl SharedDirNotifier {
    /// Opens the signal directory and starts watching it.
    ///
    /// Signals already present in the directory are not replayed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or read, or the
    /// platform watcher cannot be set up.
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let local = LocalNotifier::new();
        let seen = Arc::new(Mutex::new(scan(dir)?));

        let mut watcher = RecommendedWatcher::new(
            {
                let local = local.clone();
                let seen = Arc::clone(&seen);
                move |result: notify::Result<Event>| match result {
                    Ok(event) => on_event(&event, &local, &seen),
                    Err(e) => tracing::debug!(error = %e, "signal watcher error"),
                }
            },
            Config::default(),
        )
        .map_err(std::io::Error::other)?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(std::io::Error::other)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            local,
            seen,
            _watcher: Mutex::new(watcher),
        })
    }

    /// Returns the signal directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn write_key(&self, name: &str, content: &str) {
        let path = self.dir.join(name);
        let temp = self.dir.join(format!(".{name}.{}", uuid::Uuid::new_v4().simple()));
        let written = fs::write(&temp, content).and_then(|()| fs::rename(&temp, &path));
        match written {
            Ok(()) => {
                self.seen.lock().insert(name.to_string(), content.to_string());
            }
            Err(e) => {
                let _ = fs::remove_file(&temp);
                tracing::warn!(key = name, error = %e, "failed to write signal key");
            }
        }
    }
}

impl Notifier for SharedDirNotifier {
    fn publish(&self, signal: Signal) {
        let (name, content) = match &signal {
            Signal::Revision { db, revision } => {
                (format!("latest-revision.{db}"), revision.as_u64().to_string())
            }
            Signal::Dying { db, node } => (
                format!("deadnode.{}.{db}", node.as_u64()),
                uuid::Uuid::new_v4().to_string(),
            ),
            Signal::Intercomm { db, destination } => (
                format!("intercomm.{}.{db}", destination.as_u64()),
                uuid::Uuid::new_v4().to_string(),
            ),
        };
        self.write_key(&name, &content);
        self.local.publish(signal);
    }

    fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.local.subscribe()
    }

    fn forget_node(&self, db: &str, node: NodeId) {
        let name = format!("deadnode.{}.{db}", node.as_u64());
        let _ = fs::remove_file(self.dir.join(&name));
        self.seen.lock().remove(&name);
    }
}

/// Parses a key file name into a signal.
fn parse_key(name: &str, content: &str) -> Option<Signal> {
    let (prefix, rest) = name.split_once('.')?;
    match prefix {
        "latest-revision" => Some(Signal::Revision {
            db: rest.to_string(),
            revision: Revision::new(content.trim().parse().ok()?),
        }),
        "deadnode" => {
            let (node, db) = rest.split_once('.')?;
            Some(Signal::Dying {
                db: db.to_string(),
                node: NodeId::new(node.parse().ok()?),
            })
        }
        "intercomm" => {
            let (node, db) = rest.split_once('.')?;
            Some(Signal::Intercomm {
                db: db.to_string(),
                destination: NodeId::new(node.parse().ok()?),
            })
        }
        _ => None,
    }
}

fn scan(dir: &Path) -> std::io::Result<HashMap<String, String>> {
    let mut keys = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if let Ok(content) = fs::read_to_string(entry.path()) {
            keys.insert(name, content);
        }
    }
    Ok(keys)
}

/// Turns one filesystem event into signals for local subscribers.
fn on_event(event: &Event, local: &LocalNotifier, seen: &Mutex<HashMap<String, String>>) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in &event.paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        // Gone again, or not yet readable; a later event covers it.
        let Ok(content) = fs::read_to_string(path) else {
            continue;
        };
        {
            let mut seen = seen.lock();
            if seen.get(name) == Some(&content) {
                continue;
            }
            seen.insert(name.to_string(), content.clone());
        }
        if let Some(signal) = parse_key(name, &content) {
            local.publish(signal);
        }
    }
}
