//! ChatClient - the main interface for tidings.
//!
//! This module provides [`ChatClient`], the API a presentation layer uses to
//! send, read and page through messages.
//!
//! # Architecture
//!
//! ChatClient owns a [`Session`] and drives the pure state machines from
//! sync-core through it. All I/O goes through the Transport and
//! MessageStore traits.
//!
//! ```text
//! Application → ChatClient → Session → Transport → Server
//!                               ↓
//!                         MessageStore (sqlite / memory)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tidings_sync_client::{ChatClient, ClientConfig, MockTransport};
//! use tidings_sync_store::SqliteStore;
//!
//! let store = Arc::new(SqliteStore::new(Path::new("tidings.db")).await?);
//! let client = ChatClient::start(store, MockTransport::new(), ClientConfig::default()).await?;
//!
//! client.connect("chat.example.com:6060").await?;
//! client.attach(&topic).await?;
//! client.send(&topic, Content::text("hello")).await?;
//! ```

use std::sync::Arc;

use tidings_sync_core::FlushReport;
use tidings_sync_store::{MessageStore, StoreError};
use tidings_sync_types::{
    ClientMessage, Content, DbId, Del, DeleteTarget, Message, Seq, SeqRange, ServerMessage,
    TopicName,
};
use tokio::sync::broadcast;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::session::Session;
use crate::transport::Transport;
use crate::upload::{Attachment, Uploader};

/// The main chat client.
///
/// Cheap to clone; clones share one session.
pub struct ChatClient<T: Transport> {
    session: Arc<Session<T>>,
}

impl<T: Transport> Clone for ChatClient<T> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
        }
    }
}

impl<T: Transport> ChatClient<T> {
    /// Create a client and run startup recovery on the store.
    ///
    /// Messages left in flight by a previous run are queued again, and no
    /// topic is considered attached.
    pub async fn start(
        store: Arc<dyn MessageStore>,
        transport: T,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let session = Session::new(store, transport, config);
        let report = session.lifecycle().recover().await?;
        info!(
            "Session for {} ready ({} message(s) requeued, {} topic(s) detached)",
            session.user(),
            report.reset_syncing,
            report.detached_topics
        );
        Ok(Self {
            session: Arc::new(session),
        })
    }

    /// The underlying session.
    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Subscribe to engine events.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.session.subscribe()
    }

    /// Connect the transport.
    pub async fn connect(&self, address: &str) -> Result<(), ClientError> {
        self.session.transport().connect(address).await?;
        info!("Connected to {}", address);
        Ok(())
    }

    /// The connection dropped. Detaches every topic.
    pub async fn on_disconnect(&self) -> Result<(), ClientError> {
        self.session.topics().on_disconnect().await
    }

    /// Attach to a topic.
    pub async fn attach(&self, topic: &TopicName) -> Result<(), ClientError> {
        self.session.topics().attach(topic).await
    }

    /// Detach from a topic.
    pub async fn detach(&self, topic: &TopicName) -> Result<(), ClientError> {
        self.session.topics().detach(topic).await
    }

    /// Whether a topic is attached.
    pub fn is_attached(&self, topic: &TopicName) -> bool {
        self.session.is_attached(topic)
    }

    /// Transmit everything queued for a topic.
    pub async fn flush(&self, topic: &TopicName) -> Result<FlushReport, ClientError> {
        self.session.topics().flush(topic).await
    }

    /// Send a message.
    ///
    /// The message is queued first. When the topic is attached it is
    /// transmitted right away; if that fails it stays queued and the error
    /// is returned.
    pub async fn send(&self, topic: &TopicName, content: Content) -> Result<DbId, ClientError> {
        let lifecycle = self.session.lifecycle();
        let id = lifecycle.create_ready(topic, &content).await?;
        if self.session.is_attached(topic) {
            lifecycle.sync_one(topic, id).await?;
        }
        Ok(id)
    }

    /// Save a draft.
    pub async fn save_draft(
        &self,
        topic: &TopicName,
        content: Content,
    ) -> Result<DbId, ClientError> {
        self.session.lifecycle().create_draft(topic, &content).await
    }

    /// Replace the content of a draft.
    pub async fn update_draft(
        &self,
        topic: &TopicName,
        id: DbId,
        content: Content,
    ) -> Result<(), ClientError> {
        self.session.lifecycle().update_draft(topic, id, content).await
    }

    /// Send a saved draft.
    pub async fn send_draft(&self, topic: &TopicName, id: DbId) -> Result<(), ClientError> {
        let lifecycle = self.session.lifecycle();
        lifecycle.mark_ready(topic, id, None).await?;
        if self.session.is_attached(topic) {
            lifecycle.sync_one(topic, id).await?;
        }
        Ok(())
    }

    /// Mark messages up to `seq` as read.
    pub async fn mark_read(&self, topic: &TopicName, seq: Seq) -> Result<bool, ClientError> {
        self.session.reconciler().note_read(topic, seq).await
    }

    /// Mark messages up to `seq` as received.
    pub async fn mark_recv(&self, topic: &TopicName, seq: Seq) -> Result<bool, ClientError> {
        self.session.reconciler().note_recv(topic, seq).await
    }

    /// Tell peers the local user is typing.
    pub async fn note_typing(&self, topic: &TopicName) -> Result<(), ClientError> {
        self.session.reconciler().note_typing(topic).await
    }

    /// Start viewing a topic from its newest page.
    pub async fn open(&self, topic: &TopicName) -> Result<Vec<Message>, ClientError> {
        self.session.pages().open(topic).await
    }

    /// The current window of a topic.
    pub async fn load_visible(&self, topic: &TopicName) -> Result<Vec<Message>, ClientError> {
        self.session.pages().load_visible(topic).await
    }

    /// Grow the window of a topic by one older page.
    pub async fn load_older(&self, topic: &TopicName) -> Result<Vec<Message>, ClientError> {
        self.session.pages().load_older(topic).await
    }

    /// Delete messages by seq.
    ///
    /// The delete is recorded locally first. When the topic is attached it
    /// is sent right away; otherwise, or if sending fails, it is sent by the
    /// next flush. Returns the number of messages marked.
    pub async fn delete_messages(
        &self,
        topic: &TopicName,
        target: DeleteTarget,
        hard: bool,
    ) -> Result<u64, ClientError> {
        let lifecycle = self.session.lifecycle();
        let marked = lifecycle.mark_for_delete(topic, &target, hard).await?;
        if marked == 0 || !self.session.is_attached(topic) {
            return Ok(marked);
        }

        let request = ClientMessage::Del(Del {
            id: self.session.next_request_id(),
            topic: topic.clone(),
            target: target.clone(),
            hard,
        });
        self.session.exchange(request).await?;
        lifecycle.apply_delete(topic, &target, hard).await?;
        Ok(marked)
    }

    /// Delete one message by local id.
    ///
    /// A message the server never saw is discarded locally; no request is
    /// sent.
    pub async fn delete_message(
        &self,
        topic: &TopicName,
        id: DbId,
        hard: bool,
    ) -> Result<(), ClientError> {
        let msg = self
            .session
            .store()
            .msg_get(topic, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                topic: topic.to_string(),
                id: id.value(),
            })?;
        match msg.seq {
            None => self.session.lifecycle().discard(topic, id).await,
            Some(seq) => self
                .delete_messages(topic, DeleteTarget::Range(SeqRange::single(seq)), hard)
                .await
                .map(|_| ()),
        }
    }

    /// Upload an attachment and send it.
    pub async fn upload_and_send(
        &self,
        topic: &TopicName,
        attachment: &Attachment,
        uploader: &dyn Uploader,
    ) -> Result<DbId, ClientError> {
        self.session.upload_and_send(topic, attachment, uploader).await
    }

    /// Apply an encoded server frame received outside a request.
    pub async fn handle_frame(&self, bytes: &[u8]) -> Result<(), ClientError> {
        let msg = ServerMessage::from_bytes(bytes)?;
        self.session.handle(msg).await
    }

    /// Get a reference to the underlying transport (for testing).
    pub fn transport(&self) -> &T {
        self.session.transport()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use tidings_sync_store::MemoryStore;
    use tidings_sync_types::{Ctrl, CtrlParams, DataEvent, MessageState, UserId};

    fn grp1() -> TopicName {
        TopicName::new("grp1")
    }

    async fn client(transport: MockTransport) -> ChatClient<MockTransport> {
        ChatClient::start(Arc::new(MemoryStore::new()), transport, ClientConfig::default())
            .await
            .unwrap()
    }

    fn accept(msg: &ClientMessage) -> Vec<ServerMessage> {
        match msg.id() {
            Some(id) => vec![ServerMessage::Ctrl(Ctrl {
                id: Some(id.to_owned()),
                topic: Some(msg.topic().clone()),
                code: 200,
                text: "ok".into(),
                ts: 5,
                params: CtrlParams {
                    seq: Some(Seq::new(1)),
                    url: None,
                },
            })],
            None => vec![],
        }
    }

    #[tokio::test]
    async fn send_while_detached_only_queues() {
        let transport = MockTransport::connected();
        let client = client(transport.clone()).await;

        let id = client.send(&grp1(), Content::text("later")).await.unwrap();

        let queued = client.session().store().queued_messages(&grp1()).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, id);
        assert!(transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn send_while_attached_transmits() {
        let transport = MockTransport::connected();
        transport.set_responder(accept);
        let client = client(transport.clone()).await;
        client.attach(&grp1()).await.unwrap();

        let id = client.send(&grp1(), Content::text("now")).await.unwrap();

        let msg = client.session().store().msg_get(&grp1(), id).await.unwrap().unwrap();
        assert_eq!(msg.state, MessageState::Synced);
    }

    #[tokio::test]
    async fn draft_round_trip() {
        let transport = MockTransport::connected();
        transport.set_responder(accept);
        let client = client(transport.clone()).await;
        client.attach(&grp1()).await.unwrap();

        let id = client.save_draft(&grp1(), Content::text("dra")).await.unwrap();
        client
            .update_draft(&grp1(), id, Content::text("draft"))
            .await
            .unwrap();
        client.send_draft(&grp1(), id).await.unwrap();

        let msg = client.session().store().msg_get(&grp1(), id).await.unwrap().unwrap();
        assert_eq!(msg.state, MessageState::Synced);
        assert_eq!(msg.content.as_text(), Some("draft"));
    }

    #[tokio::test]
    async fn delete_unsynced_is_local() {
        let transport = MockTransport::connected();
        let client = client(transport.clone()).await;

        let draft = client.save_draft(&grp1(), Content::text("never sent")).await.unwrap();
        client.delete_message(&grp1(), draft, true).await.unwrap();

        assert!(client.session().store().msg_get(&grp1(), draft).await.unwrap().is_none());
        assert!(transport.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn delete_while_detached_stays_pending() {
        let client = client(MockTransport::new()).await;
        let store = client.session().store();
        store
            .msg_received(&grp1(), Seq::new(3), &UserId::new("usrBob"), &Content::text("x"), 1)
            .await
            .unwrap();

        let marked = client
            .delete_messages(&grp1(), DeleteTarget::Range(SeqRange::single(Seq::new(3))), false)
            .await
            .unwrap();

        assert_eq!(marked, 1);
        assert_eq!(store.queued_deletes(&grp1(), false).await.unwrap(), vec![Seq::new(3)]);
    }

    #[tokio::test]
    async fn handle_frame_decodes() {
        let client = client(MockTransport::new()).await;
        let frame = ServerMessage::Data(DataEvent {
            topic: grp1(),
            seq: Seq::new(12),
            from: UserId::new("usrBob"),
            content: Content::text("pushed"),
            ts: 1,
        });

        client.handle_frame(&frame.to_bytes().unwrap()).await.unwrap();

        assert_eq!(client.session().store().msg_count(&grp1()).await.unwrap(), 1);
        assert!(matches!(
            client.handle_frame(b"not a frame").await,
            Err(ClientError::Codec(_))
        ));
    }
}
