//! Error types for sync-client.

use thiserror::Error;
use tidings_sync_core::TransitionError;
use tidings_sync_store::StoreError;
use tidings_sync_types::SyncError;

use crate::transport::TransportError;
use crate::upload::UploadError;

/// Client errors.
///
/// Network-class failures leave messages in a retryable state;
/// store failures and invalid transitions abort the operation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No live connection to the server.
    #[error("not connected")]
    NotConnected,

    /// The server answered with a failure code (>= 300).
    #[error("server rejected request: {code} {text}")]
    ServerRejected {
        /// Status code.
        code: u16,
        /// Status text.
        text: String,
    },

    /// Local persistence failed; the state change was not committed.
    #[error("store write failed: {0}")]
    StoreWriteFailed(StoreError),

    /// The message is not in a state that allows the operation.
    #[error("invalid transition: {0}")]
    InvalidTransition(TransitionError),

    /// The server sent something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport error other than a missing connection.
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// Frame encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] SyncError),

    /// Attachment upload failed.
    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl ClientError {
    /// Check if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotConnected | Self::Transport(_) => true,
            Self::ServerRejected { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

impl From<TransportError> for ClientError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NotConnected | TransportError::ConnectionClosed => Self::NotConnected,
            other => Self::Transport(other),
        }
    }
}

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidTransition(t) => Self::InvalidTransition(t),
            other => Self::StoreWriteFailed(other),
        }
    }
}

impl From<TransitionError> for ClientError {
    fn from(e: TransitionError) -> Self {
        Self::InvalidTransition(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidings_sync_core::TransitionKind;
    use tidings_sync_types::MessageState;

    #[test]
    fn transport_disconnects_become_not_connected() {
        let err: ClientError = TransportError::ConnectionClosed.into();
        assert!(matches!(err, ClientError::NotConnected));

        let err: ClientError = TransportError::NotConnected.into();
        assert!(matches!(err, ClientError::NotConnected));

        let err: ClientError = TransportError::Timeout.into();
        assert!(matches!(err, ClientError::Transport(TransportError::Timeout)));
    }

    #[test]
    fn store_transition_errors_are_unwrapped() {
        let transition = TransitionError {
            from: MessageState::Syncing,
            transition: TransitionKind::Discard,
        };
        let err: ClientError = StoreError::InvalidTransition(transition).into();
        assert!(matches!(err, ClientError::InvalidTransition(t) if t == transition));

        let err: ClientError = StoreError::Backend("disk full".into()).into();
        assert!(matches!(err, ClientError::StoreWriteFailed(_)));
        assert_eq!(err.to_string(), "store write failed: backend error: disk full");
    }

    #[test]
    fn retryable_classes() {
        assert!(ClientError::NotConnected.is_retryable());
        assert!(ClientError::ServerRejected {
            code: 503,
            text: "unavailable".into()
        }
        .is_retryable());
        assert!(!ClientError::ServerRejected {
            code: 403,
            text: "forbidden".into()
        }
        .is_retryable());
        assert!(!ClientError::Protocol("bad frame".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ClientError::ServerRejected {
            code: 404,
            text: "topic not found".into(),
        };
        assert_eq!(err.to_string(), "server rejected request: 404 topic not found");
    }
}
