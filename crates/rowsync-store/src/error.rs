//! Error types for the store module.

use rowsync_core::DbId;
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// No database with this id has been opened.
    #[error("database not found: {0}")]
    DatabaseNotFound(DbId),

    /// A local write targeted a row that has been deleted.
    #[error("row {table}[{pk}] has been deleted")]
    RowDeleted { table: String, pk: String },

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A lock or blocking task failed.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Injected failure (memory store fault injection).
    #[error("injected failure after {0} writes")]
    Injected(usize),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
