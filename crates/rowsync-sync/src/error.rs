//! Error types for the sync module.

use rowsync_core::QueryId;
use thiserror::Error;

/// Errors that can occur during sync operations.
///
/// Protocol outcomes such as a schema mismatch or an out-of-order batch are
/// not errors: they are [`ApplyStatus`](crate::messages::ApplyStatus) values
/// carried in responses. Errors are faults the caller has to act on.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A change in a batch failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] rowsync_core::ValidationError),

    /// Frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] rowsync_store::StoreError),

    /// A query id was not registered for the database.
    #[error("unknown query: {0}")]
    UnknownQuery(QueryId),

    /// The peer sent a message that does not fit the conversation.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Timeout waiting for peer.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Whether retrying the identical operation may succeed.
    ///
    /// Storage faults are transient and the batch is retried as is;
    /// transport faults and timeouts call for a reconnect and resume.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Store(_) | SyncError::Transport(_) | SyncError::Timeout(_)
        )
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(SyncError::Timeout("ack".into()).is_retryable());
        let store = rowsync_store::StoreError::Unavailable("x".into());
        assert!(SyncError::Store(store).is_retryable());

        assert!(!SyncError::Codec("bad frame".into()).is_retryable());
        assert!(!SyncError::UnknownQuery(QueryId::new("gone")).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }
}
