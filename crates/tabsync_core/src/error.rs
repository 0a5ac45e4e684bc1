//! Error types for tabsync core.

use tabsync_storage::StorageError;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in tabsync core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Transaction was aborted.
    #[error("transaction aborted: {reason}")]
    TransactionAborted {
        /// Reason for abort.
        reason: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// A tracked mutation targeted an internal table.
    #[error("table {table:?} is internal and cannot be mutated directly")]
    ProtectedTable {
        /// The table that was targeted.
        table: String,
    },
}

impl CoreError {
    /// Creates a transaction aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns true if this error means the store handle is gone.
    ///
    /// Closing is an expected lifecycle event, so callers running
    /// background work treat these errors as a signal to stop quietly.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::DatabaseClosed | Self::Storage(StorageError::Closed)
        )
    }
}
