//! Error types for the coordination layer.

use tabsync_core::{CoreError, NodeId};
use thiserror::Error;

/// Result type for coordination operations.
pub type ObserveResult<T> = Result<T, ObserveError>;

/// Errors that can occur while observing a store.
#[derive(Error, Debug)]
pub enum ObserveError {
    /// Database error.
    #[error("database error: {0}")]
    Core(#[from] CoreError),

    /// This instance's own registry record disappeared.
    ///
    /// A peer evicted it, believing it dead. The instance has torn itself
    /// down; the host should reinitialise.
    #[error("{node} was evicted from the node registry")]
    SelfEvicted {
        /// The evicted node.
        node: NodeId,
    },

    /// The coordinator has not registered a node yet.
    #[error("coordinator is not attached to the store")]
    NotAttached,

    /// Configuration values are inconsistent.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A reply to an intercomm request did not arrive in time.
    #[error("no reply to request {request_id} within the timeout")]
    ReplyTimeout {
        /// The request that went unanswered.
        request_id: String,
    },

    /// The addressee answered an intercomm request with a failure.
    #[error("remote node failed request: {0}")]
    RemoteFailure(String),

    /// The operation was abandoned because the coordinator stopped.
    #[error("operation cancelled")]
    Cancelled,
}

impl ObserveError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Returns true for the store-closed family.
    ///
    /// These are expected during shutdown races and are swallowed by every
    /// background loop.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Core(e) => e.is_closed(),
            Self::Cancelled => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_classification() {
        assert!(ObserveError::Core(CoreError::DatabaseClosed).is_closed());
        assert!(ObserveError::Cancelled.is_closed());
        assert!(!ObserveError::SelfEvicted { node: NodeId(3) }.is_closed());
        assert!(!ObserveError::NotAttached.is_closed());
    }

    #[test]
    fn display() {
        let err = ObserveError::SelfEvicted { node: NodeId(3) };
        assert_eq!(err.to_string(), "node:3 was evicted from the node registry");
    }
}
