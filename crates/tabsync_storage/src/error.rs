//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A row or table could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,

    /// A transaction touched a table it did not declare in its scope.
    #[error("table {table:?} is not in the transaction scope")]
    TableNotInScope {
        /// Name of the table that was accessed.
        table: String,
    },

    /// A table name cannot be used by this backend.
    #[error("invalid table name: {name:?}")]
    InvalidTableName {
        /// The rejected name.
        name: String,
    },
}

impl StorageError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Creates a table-not-in-scope error.
    pub fn not_in_scope(table: impl Into<String>) -> Self {
        Self::TableNotInScope {
            table: table.into(),
        }
    }
}
