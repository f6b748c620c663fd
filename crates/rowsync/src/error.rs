//! Error types for replicas.

use rowsync_store::StoreError;
use rowsync_sync::{ApplyStatus, SyncError};
use thiserror::Error;

/// Errors that can occur during replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The peer kept refusing a push.
    #[error("peer rejected changes: {status:?}")]
    Rejected { status: ApplyStatus },

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReplicaError {
    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicaError::Sync(e) => e.is_retryable(),
            ReplicaError::Store(_) => true,
            _ => false,
        }
    }
}

/// Result type for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;
