//! Error types for tidings wire and content encoding.

use thiserror::Error;

/// Errors raised while encoding or decoding data-model values.
#[derive(Debug, Error)]
pub enum SyncError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Stored content document could not be encoded or parsed
    #[error("content codec failed: {0}")]
    Content(#[source] serde_json::Error),

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SyncError::InvalidData("unknown state code 7".into());
        assert_eq!(err.to_string(), "invalid data: unknown state code 7");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}
