//! Error types for sync-store.

use tidings_sync_core::TransitionError;
use tidings_sync_types::SyncError;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Message not found.
    #[error("message not found: {topic}/{id}")]
    NotFound {
        /// Topic that was searched.
        topic: String,
        /// The local id that was not found.
        id: i64,
    },

    /// The row rejected the requested lifecycle transition.
    #[error("invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),

    /// Another live message already holds this sequence number.
    #[error("duplicate seq {seq} in topic {topic}")]
    DuplicateSeq {
        /// The topic.
        topic: String,
        /// The conflicting sequence number.
        seq: u64,
    },

    /// A stored value could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] SyncError),

    /// The backend refused the write.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Check if this error comes from a rejected lifecycle transition.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition(_))
    }
}
