//! Error types for the message feed.

use crate::subscriptions::DropReason;
use thiserror::Error;

/// Main error type for feed, identity and connection operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The local preference store could not be read or written.
    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    /// The feed backend cannot be reached (connection closed, storage failed).
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A live subscription was lost after its initial replay.
    #[error("Subscription terminated: {0:?}")]
    SubscriptionTerminated(DropReason),

    #[error("No identity is set for this session")]
    NotSignedIn,

    #[error("Data directory is locked by another process")]
    Locked,

    #[error("Data directory not initialized")]
    NotInitialized,

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl FeedError {
    /// Whether a caller may reasonably retry the failed operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FeedError::BackendUnavailable(_)
                | FeedError::PersistenceUnavailable(_)
                | FeedError::SubscriptionTerminated(_)
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;
