//! Attachment upload and send.
//!
//! ```text
//! draft(placeholder) ─▶ upload ─ok──▶ ready(url) ─▶ sync (if attached)
//!                         └─fail─▶ discard
//! ```

use async_trait::async_trait;
use thiserror::Error;
use tidings_sync_types::{Content, DbId, TopicName};
use tracing::warn;

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::session::Session;
use crate::transport::Transport;

/// A file to attach to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// File name shown to peers.
    pub name: String,
    /// MIME type.
    pub mime: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

impl Attachment {
    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Upload failed.
#[derive(Debug, Clone, Error)]
#[error("upload failed: {0}")]
pub struct UploadError(pub String);

/// Stores attachment bytes out of band and returns their location.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `attachment`, calling `progress(sent, total)` as bytes go out.
    async fn upload(
        &self,
        attachment: &Attachment,
        progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<String, UploadError>;
}

impl<T: Transport> Session<T> {
    /// Upload an attachment and send it as a message.
    ///
    /// The message exists as a draft while the upload runs and is discarded
    /// if the upload fails. Once uploaded it is queued, and transmitted
    /// right away when the topic is attached.
    pub async fn upload_and_send(
        &self,
        topic: &TopicName,
        attachment: &Attachment,
        uploader: &dyn Uploader,
    ) -> Result<DbId, ClientError> {
        let lifecycle = self.lifecycle();
        let placeholder =
            Content::attachment(&attachment.mime, &attachment.name, None, attachment.size());
        let id = lifecycle.create_draft(topic, &placeholder).await?;

        let progress = |sent: u64, total: u64| {
            self.emit(ClientEvent::UploadProgress {
                topic: topic.clone(),
                id,
                sent,
                total,
            })
        };

        let url = match uploader.upload(attachment, &progress).await {
            Ok(url) => url,
            Err(e) => {
                warn!("Upload of {} for {} failed: {}", attachment.name, topic, e);
                lifecycle.discard(topic, id).await?;
                return Err(e.into());
            }
        };

        let content = Content::attachment(
            &attachment.mime,
            &attachment.name,
            Some(&url),
            attachment.size(),
        );
        lifecycle.mark_ready(topic, id, Some(content)).await?;
        if self.is_attached(topic) {
            lifecycle.sync_one(topic, id).await?;
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::MockTransport;
    use std::sync::Arc;
    use tidings_sync_store::MemoryStore;
    use tidings_sync_types::MessageState;

    struct ChunkedUploader {
        fail: bool,
    }

    #[async_trait]
    impl Uploader for ChunkedUploader {
        async fn upload(
            &self,
            attachment: &Attachment,
            progress: &(dyn Fn(u64, u64) + Send + Sync),
        ) -> Result<String, UploadError> {
            let total = attachment.size();
            progress(total / 2, total);
            if self.fail {
                return Err(UploadError("connection reset".into()));
            }
            progress(total, total);
            Ok(format!("https://files.example.com/{}", attachment.name))
        }
    }

    fn photo() -> Attachment {
        Attachment {
            name: "cat.jpg".into(),
            mime: "image/jpeg".into(),
            bytes: vec![0u8; 64],
        }
    }

    #[tokio::test]
    async fn uploaded_attachment_is_queued() {
        let session = Session::new(
            Arc::new(MemoryStore::new()),
            MockTransport::new(),
            ClientConfig::default(),
        );
        let topic = TopicName::new("grp1");
        let mut events = session.subscribe();

        let id = session
            .upload_and_send(&topic, &photo(), &ChunkedUploader { fail: false })
            .await
            .unwrap();

        let msg = session.store().msg_get(&topic, id).await.unwrap().unwrap();
        assert_eq!(msg.state, MessageState::Ready);
        assert_eq!(
            msg.content,
            Content::attachment(
                "image/jpeg",
                "cat.jpg",
                Some("https://files.example.com/cat.jpg"),
                64
            )
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::UploadProgress {
                topic: topic.clone(),
                id,
                sent: 32,
                total: 64
            }
        );
    }

    #[tokio::test]
    async fn failed_upload_discards_draft() {
        let session = Session::new(
            Arc::new(MemoryStore::new()),
            MockTransport::new(),
            ClientConfig::default(),
        );
        let topic = TopicName::new("grp1");

        let err = session
            .upload_and_send(&topic, &photo(), &ChunkedUploader { fail: true })
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Upload(_)));
        assert_eq!(session.store().msg_count(&topic).await.unwrap(), 0);
    }
}
