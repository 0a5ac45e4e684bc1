//! Core type definitions for tabsync.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a change record in the change log.
///
/// Revisions are assigned by the change log's auto-increment counter, start
/// at 1 and are never reused. `Revision::ZERO` means "before any change".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// The revision preceding every change record.
    pub const ZERO: Self = Self(0);

    /// Creates a new revision.
    #[must_use]
    pub const fn new(rev: u64) -> Self {
        Self(rev)
    }

    /// Returns the raw revision value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next revision.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rev:{}", self.0)
    }
}

/// Identifier of a participant node in the registry.
///
/// Node IDs come from the registry's auto-increment counter and are never
/// reused within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Creates a new node ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_ordering() {
        let r1 = Revision::new(1);
        let r2 = r1.next();
        assert!(Revision::ZERO < r1);
        assert!(r1 < r2);
        assert_eq!(r2.as_u64(), 2);
    }

    #[test]
    fn display() {
        assert_eq!(Revision::new(42).to_string(), "rev:42");
        assert_eq!(NodeId::new(7).to_string(), "node:7");
    }
}
