//! Message lifecycle operations.
//!
//! Every state change goes through [`MessageStore::msg_transition`] so the
//! transition table is checked against the persisted row, atomically. A
//! failed write leaves the row untouched and is returned to the caller.
//!
//! [`MessageStore::msg_transition`]: tidings_sync_store::MessageStore::msg_transition

use tidings_sync_core::Transition;
use tidings_sync_store::{RecoveryReport, StoreError};
use tidings_sync_types::{
    now_millis, ClientMessage, Content, DbId, DeleteTarget, Message, Pub, Seq, Timestamp,
    TopicName,
};
use tracing::{debug, error, info, warn};

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::session::Session;
use crate::transport::Transport;

/// Lifecycle operations for messages, keyed by local id.
pub struct Lifecycle<'a, T: Transport> {
    session: &'a Session<T>,
}

impl<'a, T: Transport> Lifecycle<'a, T> {
    pub(crate) fn new(session: &'a Session<T>) -> Self {
        Self { session }
    }

    /// Create a message in `Draft`.
    pub async fn create_draft(
        &self,
        topic: &TopicName,
        content: &Content,
    ) -> Result<DbId, ClientError> {
        let id = self
            .session
            .store()
            .msg_draft(topic, self.session.user(), content, now_millis())
            .await?;
        debug!("Created draft {} in {}", id, topic);
        Ok(id)
    }

    /// Create a message in `Ready`.
    pub async fn create_ready(
        &self,
        topic: &TopicName,
        content: &Content,
    ) -> Result<DbId, ClientError> {
        let id = self
            .session
            .store()
            .msg_send(topic, self.session.user(), content, now_millis())
            .await?;
        debug!("Queued message {} in {}", id, topic);
        Ok(id)
    }

    /// Replace the content of a draft.
    pub async fn update_draft(
        &self,
        topic: &TopicName,
        id: DbId,
        content: Content,
    ) -> Result<(), ClientError> {
        self.transition(topic, id, Transition::UpdateDraft { content })
            .await
    }

    /// Finalize a draft, optionally replacing its content.
    pub async fn mark_ready(
        &self,
        topic: &TopicName,
        id: DbId,
        content: Option<Content>,
    ) -> Result<(), ClientError> {
        self.transition(topic, id, Transition::MarkReady { content })
            .await
    }

    /// Move a ready message in flight and return it.
    ///
    /// Rejected with [`ClientError::InvalidTransition`] when the message is
    /// already in flight or past it.
    pub async fn begin_sync(&self, topic: &TopicName, id: DbId) -> Result<Message, ClientError> {
        self.transition(topic, id, Transition::BeginSync).await?;
        self.session
            .store()
            .msg_get(topic, id)
            .await?
            .ok_or_else(|| not_found(topic, id))
    }

    /// Confirm an in-flight message with the server's seq and time.
    pub async fn confirm_synced(
        &self,
        topic: &TopicName,
        id: DbId,
        seq: Seq,
        ts: Timestamp,
    ) -> Result<(), ClientError> {
        self.session.store().msg_delivered(topic, id, seq, ts).await?;
        debug!("Message {} in {} synced as seq {}", id, topic, seq);
        Ok(())
    }

    /// Return an in-flight message to `Ready`.
    pub async fn sync_failed(&self, topic: &TopicName, id: DbId) -> Result<(), ClientError> {
        self.transition(topic, id, Transition::SyncFailed).await
    }

    /// Drop a message that never reached the server.
    pub async fn discard(&self, topic: &TopicName, id: DbId) -> Result<(), ClientError> {
        self.session.store().msg_discard(topic, id).await?;
        debug!("Discarded message {} in {}", id, topic);
        Ok(())
    }

    /// Record a delete locally, before the server confirms it.
    pub async fn mark_for_delete(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        hard: bool,
    ) -> Result<u64, ClientError> {
        let changed = self
            .session
            .store()
            .msg_mark_to_delete(topic, target, hard)
            .await?;
        debug!("Marked {} message(s) in {} for delete (hard: {})", changed, topic, hard);
        Ok(changed)
    }

    /// Apply a delete the server confirmed.
    pub async fn apply_delete(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        hard: bool,
    ) -> Result<u64, ClientError> {
        let changed = self
            .session
            .store()
            .msg_apply_delete(topic, target, hard)
            .await?;
        debug!("Applied delete to {} message(s) in {} (hard: {})", changed, topic, hard);
        Ok(changed)
    }

    /// Transmit one ready message and settle its state.
    ///
    /// On success the message is `Synced` with the server's seq. On any
    /// network or server failure it is back in `Ready` and the error is
    /// returned.
    pub async fn sync_one(&self, topic: &TopicName, id: DbId) -> Result<Seq, ClientError> {
        let msg = self.begin_sync(topic, id).await?;
        let request = ClientMessage::Pub(Pub {
            id: self.session.next_request_id(),
            topic: topic.clone(),
            content: msg.content,
        });

        let outcome = match self.session.exchange(request).await {
            Ok(ctrl) => match ctrl.params.seq {
                Some(seq) => Ok((seq, ctrl.ts)),
                None => Err(ClientError::Protocol("publish reply without seq".into())),
            },
            Err(e) => Err(e),
        };

        match outcome {
            Ok((seq, ts)) => {
                match self.confirm_synced(topic, id, seq, ts).await {
                    Ok(()) => {}
                    Err(ClientError::StoreWriteFailed(StoreError::DuplicateSeq { .. })) => {
                        self.fold_into_stored(topic, id, seq).await?;
                    }
                    Err(e) => {
                        error!(
                            "Failed to confirm message {} in {} as seq {}: {}",
                            id, topic, seq, e
                        );
                        return Err(e);
                    }
                }
                self.session.emit(ClientEvent::MessageSynced {
                    topic: topic.clone(),
                    id,
                    seq,
                });
                Ok(seq)
            }
            Err(err) => {
                if let Err(e) = self.sync_failed(topic, id).await {
                    error!("Failed to requeue message {} in {}: {}", id, topic, e);
                    return Err(e);
                }
                warn!("Send of message {} in {} failed: {}", id, topic, err);
                self.session.emit(ClientEvent::SendFailed {
                    topic: topic.clone(),
                    id,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// The server accepted message `id` as `seq`, but the store already
    /// holds that seq under another row. The stored row stands for the
    /// message and the local copy is dropped, so it is never sent again.
    async fn fold_into_stored(
        &self,
        topic: &TopicName,
        id: DbId,
        seq: Seq,
    ) -> Result<(), ClientError> {
        self.transition(topic, id, Transition::SyncFailed).await?;
        self.discard(topic, id).await?;
        info!("Message {} in {} already stored as seq {}", id, topic, seq);
        Ok(())
    }

    /// Startup recovery: requeue messages left in flight.
    pub async fn recover(&self) -> Result<RecoveryReport, ClientError> {
        let report = self.session.store().recover().await?;
        if report.reset_syncing > 0 {
            info!("Requeued {} message(s) left in flight", report.reset_syncing);
        }
        Ok(report)
    }

    async fn transition(
        &self,
        topic: &TopicName,
        id: DbId,
        transition: Transition,
    ) -> Result<(), ClientError> {
        let kind = transition.kind();
        self.session
            .store()
            .msg_transition(topic, id, transition)
            .await?;
        debug!("Message {} in {}: {}", id, topic, kind);
        Ok(())
    }
}

fn not_found(topic: &TopicName, id: DbId) -> ClientError {
    StoreError::NotFound {
        topic: topic.to_string(),
        id: id.value(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::MockTransport;
    use std::sync::Arc;
    use tidings_sync_store::{MemoryStore, MessageStore};
    use tidings_sync_types::{Ctrl, CtrlParams, MessageState, ServerMessage};

    fn grp1() -> TopicName {
        TopicName::new("grp1")
    }

    fn session(transport: MockTransport, store: MemoryStore) -> Session<MockTransport> {
        Session::new(Arc::new(store), transport, ClientConfig::default())
    }

    fn accept_with_seq(seq: Option<u64>) -> impl FnMut(&ClientMessage) -> Vec<ServerMessage> {
        move |msg| {
            vec![ServerMessage::Ctrl(Ctrl {
                id: msg.id().map(str::to_owned),
                topic: Some(msg.topic().clone()),
                code: 200,
                text: "accepted".into(),
                ts: 1_700_000_000_000,
                params: CtrlParams {
                    seq: seq.map(Seq::new),
                    url: None,
                },
            })]
        }
    }

    async fn state_of(session: &Session<MockTransport>, id: DbId) -> MessageState {
        session
            .store()
            .msg_get(&grp1(), id)
            .await
            .unwrap()
            .unwrap()
            .state
    }

    // ===========================================
    // Local transitions
    // ===========================================

    #[tokio::test]
    async fn draft_edit_then_ready() {
        let session = session(MockTransport::new(), MemoryStore::new());
        let lifecycle = session.lifecycle();

        let id = lifecycle.create_draft(&grp1(), &Content::text("hel")).await.unwrap();
        lifecycle
            .update_draft(&grp1(), id, Content::text("hello"))
            .await
            .unwrap();
        lifecycle.mark_ready(&grp1(), id, None).await.unwrap();

        let msg = session.store().msg_get(&grp1(), id).await.unwrap().unwrap();
        assert_eq!(msg.state, MessageState::Ready);
        assert_eq!(msg.content.as_text(), Some("hello"));
        assert_eq!(msg.from, *session.user());
    }

    #[tokio::test]
    async fn second_begin_sync_is_rejected() {
        let session = session(MockTransport::new(), MemoryStore::new());
        let lifecycle = session.lifecycle();
        let id = lifecycle.create_ready(&grp1(), &Content::text("x")).await.unwrap();

        lifecycle.begin_sync(&grp1(), id).await.unwrap();
        let err = lifecycle.begin_sync(&grp1(), id).await.unwrap_err();

        assert!(matches!(err, ClientError::InvalidTransition(_)));
        assert_eq!(state_of(&session, id).await, MessageState::Syncing);
    }

    #[tokio::test]
    async fn discard_in_flight_is_rejected() {
        let session = session(MockTransport::new(), MemoryStore::new());
        let lifecycle = session.lifecycle();
        let id = lifecycle.create_ready(&grp1(), &Content::text("x")).await.unwrap();
        lifecycle.begin_sync(&grp1(), id).await.unwrap();

        let err = lifecycle.discard(&grp1(), id).await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn store_failure_aborts_transition() {
        let store = MemoryStore::new();
        let session = session(MockTransport::new(), store.clone());
        let lifecycle = session.lifecycle();
        let id = lifecycle.create_ready(&grp1(), &Content::text("x")).await.unwrap();

        store.set_fail_writes(true);
        let err = lifecycle.begin_sync(&grp1(), id).await.unwrap_err();
        store.set_fail_writes(false);

        assert!(matches!(err, ClientError::StoreWriteFailed(_)));
        assert_eq!(state_of(&session, id).await, MessageState::Ready);
    }

    // ===========================================
    // Transmission
    // ===========================================

    #[tokio::test]
    async fn sync_one_confirms_with_server_seq() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_with_seq(Some(42)));
        let session = session(transport, MemoryStore::new());
        let mut events = session.subscribe();

        let id = session
            .lifecycle()
            .create_ready(&grp1(), &Content::text("hello"))
            .await
            .unwrap();
        let seq = session.lifecycle().sync_one(&grp1(), id).await.unwrap();

        assert_eq!(seq, Seq::new(42));
        let msg = session.store().msg_get(&grp1(), id).await.unwrap().unwrap();
        assert_eq!(msg.state, MessageState::Synced);
        assert_eq!(msg.seq, Some(Seq::new(42)));
        assert_eq!(msg.ts, 1_700_000_000_000);
        assert_eq!(
            events.try_recv().unwrap(),
            ClientEvent::MessageSynced {
                topic: grp1(),
                id,
                seq: Seq::new(42)
            }
        );
    }

    #[tokio::test]
    async fn sync_one_offline_requeues() {
        let session = session(MockTransport::new(), MemoryStore::new());
        let id = session
            .lifecycle()
            .create_ready(&grp1(), &Content::text("hello"))
            .await
            .unwrap();

        let err = session.lifecycle().sync_one(&grp1(), id).await.unwrap_err();

        assert!(matches!(err, ClientError::NotConnected));
        let msg = session.store().msg_get(&grp1(), id).await.unwrap().unwrap();
        assert_eq!(msg.state, MessageState::Ready);
        assert_eq!(msg.content.as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn acked_seq_already_cached_drops_local_copy() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_with_seq(Some(5)));
        let store = MemoryStore::new();
        let session = session(transport.clone(), store.clone());
        let bob = tidings_sync_types::UserId::new("usrBob");
        store
            .msg_received(&grp1(), Seq::new(5), &bob, &Content::text("hello"), 1)
            .await
            .unwrap();
        let target = DeleteTarget::from_seqs(vec![Seq::new(5)]).unwrap();
        store.msg_apply_delete(&grp1(), &target, false).await.unwrap();
        let id = session
            .lifecycle()
            .create_ready(&grp1(), &Content::text("hello"))
            .await
            .unwrap();

        let seq = session.lifecycle().sync_one(&grp1(), id).await.unwrap();

        assert_eq!(seq, Seq::new(5));
        assert!(session.store().msg_get(&grp1(), id).await.unwrap().is_none());
        assert!(session.store().queued_messages(&grp1()).await.unwrap().is_empty());
        session.topics().flush(&grp1()).await.unwrap();
        let pubs = transport
            .sent_client_messages()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Pub(_)))
            .count();
        assert_eq!(pubs, 1);
    }

    #[tokio::test]
    async fn reply_without_seq_requeues() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_with_seq(None));
        let session = session(transport, MemoryStore::new());
        let id = session
            .lifecycle()
            .create_ready(&grp1(), &Content::text("x"))
            .await
            .unwrap();

        let err = session.lifecycle().sync_one(&grp1(), id).await.unwrap_err();

        assert!(matches!(err, ClientError::Protocol(_)));
        assert_eq!(state_of(&session, id).await, MessageState::Ready);
    }

    #[tokio::test]
    async fn recover_requeues_in_flight() {
        let session = session(MockTransport::new(), MemoryStore::new());
        let lifecycle = session.lifecycle();
        let id = lifecycle.create_ready(&grp1(), &Content::text("x")).await.unwrap();
        lifecycle.begin_sync(&grp1(), id).await.unwrap();

        let report = lifecycle.recover().await.unwrap();

        assert_eq!(report.reset_syncing, 1);
        assert_eq!(state_of(&session, id).await, MessageState::Ready);
    }
}
