//! # tabsync Testkit
//!
//! Test utilities for tabsync.
//!
//! This crate provides:
//! - A simulated multi-instance cluster on one shared in-memory store, with
//!   a manually stepped clock
//! - Store fixtures and population helpers
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use std::time::Duration;
//! use tabsync_testkit::prelude::*;
//!
//! let cluster = Cluster::new(2);
//! cluster.write(0, "notes", 3);
//! cluster.tick(Duration::from_secs(1));
//!
//! assert_eq!(cluster.instance(1).drain_changes().len(), 3);
//! assert_eq!(cluster.masters().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cluster;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use cluster::*;
pub use fixtures::*;
pub use generators::*;
