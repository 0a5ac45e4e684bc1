//! # tabsync observe
//!
//! Coordination layer for several instances sharing one tabsync store.
//!
//! Each instance registers as a node in the `_syncNodes` table, keeps it
//! alive with heartbeats, and reads the change log from its own position.
//! One live node is master; stale nodes are marked, then evicted after a
//! grace period, and a master that stalls is replaced. Instances exchange
//! point-to-point messages through the `_intercomm` table.
//!
//! Everything is coordinated through the shared store. Notifications only
//! shorten latency; every outcome they trigger is also reached by polling.
//!
//! ## Modules
//!
//! - [`coordinator`]: the per-store owner of loops and state
//! - [`node`]: registry records, liveness and election
//! - [`reader`]: batched change delivery
//! - [`cleanup`]: eviction, failover and pruning
//! - [`intercomm`]: the message mailbox
//! - [`notifier`]: in-process and shared-directory signals

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cleanup;
mod clock;
mod config;
pub mod coordinator;
mod error;
mod feed;
mod heartbeat;
pub mod intercomm;
pub mod node;
pub mod notifier;
pub mod reader;

pub use cleanup::CleanupReport;
pub use clock::{Clock, MockClock, SystemClock};
pub use config::ObserveConfig;
pub use coordinator::Coordinator;
pub use error::{ObserveError, ObserveResult};
pub use feed::{ChangeBatch, Feed, LifecycleEvent};
pub use heartbeat::Heartbeat;
pub use intercomm::{ConsumeReport, IntercommMessage, Mailbox, ReplyHandle, INTERCOMM_TABLE};
pub use node::{NodeKind, NodeLiveness, RemoteNodeState, RemoteStatus, SyncNode, NODES_TABLE};
pub use notifier::{LocalNotifier, Notifier, SharedDirNotifier, Signal};
pub use reader::{ChangeReader, ReadSummary};
