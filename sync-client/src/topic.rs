//! Topic attach orchestration.
//!
//! Drives the attach state machine from sync-core and performs the actions
//! it returns:
//!
//! ```text
//! attach ─▶ Subscribe ─ok─▶ Emit(Attached) ─▶ FlushQueued ─▶ LoadVisible
//!               └─fail─▶ [RequestReconnect] ─▶ Emit(AttachFailed)
//! ```
//!
//! Nothing here loops on failure. A topic that failed to attach stays
//! detached until the caller attaches again. That includes a subscribe the
//! server accepted but whose attached flag could not be stored.

use std::collections::VecDeque;

use tidings_sync_core::{
    AttachAction, AttachEvent, AttachState, FailureKind, FlushReport, Outbox, TopicEvent,
};
use tidings_sync_types::{ClientMessage, Del, DeleteTarget, Leave, MetaQuery, Sub, TopicName};
use tracing::{debug, error, info, warn};

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::session::Session;
use crate::transport::Transport;

/// Attach, detach and flush for topics of a session.
pub struct TopicSync<'a, T: Transport> {
    session: &'a Session<T>,
}

impl<'a, T: Transport> TopicSync<'a, T> {
    pub(crate) fn new(session: &'a Session<T>) -> Self {
        Self { session }
    }

    /// Subscribe to `topic`, then flush its queue and load its window.
    ///
    /// Succeeds immediately when the topic is already attached. A
    /// `NotConnected` failure requests a reconnect from the transport and
    /// leaves the topic detached.
    pub async fn attach(&self, topic: &TopicName) -> Result<(), ClientError> {
        let actions = self
            .session
            .attach_event(topic, AttachEvent::AttachRequested);
        self.run(topic, actions).await
    }

    /// Leave `topic`. Safe to call when not attached.
    pub async fn detach(&self, topic: &TopicName) -> Result<(), ClientError> {
        let actions = self.session.attach_event(topic, AttachEvent::LeaveRequested);
        self.run(topic, actions).await
    }

    /// The connection dropped: every topic is detached.
    pub async fn on_disconnect(&self) -> Result<(), ClientError> {
        for topic in self.session.attached_topics() {
            let actions = self.session.attach_event(&topic, AttachEvent::ConnectionLost);
            self.run(&topic, actions).await?;
        }
        Ok(())
    }

    /// Transmit queued messages in creation order, then pending deletes.
    ///
    /// Each queued message is tried at most once. The pass stops at the
    /// first `NotConnected`; everything not confirmed stays queued.
    pub async fn flush(&self, topic: &TopicName) -> Result<FlushReport, ClientError> {
        let store = self.session.store();
        let lifecycle = self.session.lifecycle();
        let queued = store.queued_messages(topic).await?;
        let mut outbox = Outbox::from_queued(queued.iter().map(|m| m.id));

        while let Some(id) = outbox.next() {
            match lifecycle.sync_one(topic, id).await {
                Ok(_) => outbox.ack(id),
                Err(ClientError::NotConnected) => {
                    outbox.nack(id);
                    outbox.halt();
                }
                Err(ClientError::InvalidTransition(e)) => {
                    // Moved by someone else since the queue was read.
                    debug!("Skipping message {} in {}: {}", id, topic, e);
                    outbox.nack(id);
                }
                Err(e @ (ClientError::StoreWriteFailed(_) | ClientError::Codec(_))) => {
                    return Err(e);
                }
                Err(_) => outbox.nack(id),
            }
        }

        if !outbox.is_halted() {
            self.flush_deletes(topic, false).await?;
            self.flush_deletes(topic, true).await?;
        }

        let report = outbox.into_report();
        info!(
            "Flushed {}: {} sent, {} failed, {} not tried",
            topic,
            report.sent.len(),
            report.failed.len(),
            report.remaining.len()
        );
        Ok(report)
    }

    async fn flush_deletes(&self, topic: &TopicName, hard: bool) -> Result<(), ClientError> {
        let seqs = self.session.store().queued_deletes(topic, hard).await?;
        let Some(target) = DeleteTarget::from_seqs(seqs) else {
            return Ok(());
        };

        let request = ClientMessage::Del(Del {
            id: self.session.next_request_id(),
            topic: topic.clone(),
            target: target.clone(),
            hard,
        });
        match self.session.exchange(request).await {
            Ok(_) => {
                self.session
                    .lifecycle()
                    .apply_delete(topic, &target, hard)
                    .await?;
            }
            Err(e) if e.is_retryable() || matches!(e, ClientError::ServerRejected { .. }) => {
                warn!("Pending deletes in {} not sent: {}", topic, e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn run(&self, topic: &TopicName, actions: Vec<AttachAction>) -> Result<(), ClientError> {
        let mut work: VecDeque<AttachAction> = actions.into();
        let mut failure = None;

        while let Some(action) = work.pop_front() {
            match action {
                AttachAction::Subscribe => match self.subscribe(topic).await {
                    Ok(()) => work.extend(
                        self.session
                            .attach_event(topic, AttachEvent::SubscribeSucceeded),
                    ),
                    Err(e) => {
                        let kind = match e {
                            ClientError::NotConnected => FailureKind::NotConnected,
                            _ => FailureKind::Other,
                        };
                        warn!("Attach to {} failed: {}", topic, e);
                        work.extend(self.session.attach_event(
                            topic,
                            AttachEvent::SubscribeFailed {
                                kind,
                                error: e.to_string(),
                            },
                        ));
                        failure = Some(e);
                    }
                },
                AttachAction::FlushQueued => {
                    if self.session.config().sync.flush_on_attach {
                        self.flush(topic).await?;
                    }
                }
                AttachAction::LoadVisible => {
                    self.session.pages().load_visible(topic).await?;
                }
                AttachAction::RequestReconnect => {
                    self.session.transport().request_reconnect().await;
                }
                AttachAction::Leave => self.leave(topic).await,
                AttachAction::Emit(event) => self.emit(topic, event).await?,
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn subscribe(&self, topic: &TopicName) -> Result<(), ClientError> {
        let since = self
            .session
            .store()
            .cached_range(topic)
            .await?
            .map(|range| range.high());
        let request = ClientMessage::Sub(Sub {
            id: self.session.next_request_id(),
            topic: topic.clone(),
            get: Some(
                MetaQuery::new()
                    .with_desc()
                    .with_sub()
                    .with_data_since(since)
                    .with_del(),
            ),
        });
        self.session.exchange(request).await?;
        Ok(())
    }

    async fn leave(&self, topic: &TopicName) {
        let request = ClientMessage::Leave(Leave {
            id: self.session.next_request_id(),
            topic: topic.clone(),
        });
        if let Err(e) = self.session.exchange(request).await {
            warn!("Leave of {} not acknowledged: {}", topic, e);
        }
    }

    async fn emit(&self, topic: &TopicName, event: TopicEvent) -> Result<(), ClientError> {
        let event = match event {
            TopicEvent::Attached => {
                if let Err(e) = self.session.store().topic_set_attached(topic, true).await {
                    error!("Failed to persist attach of {}: {}", topic, e);
                    self.session.set_attach_state(topic, AttachState::Detached);
                    return Err(e.into());
                }
                info!("Attached to {}", topic);
                ClientEvent::Attached {
                    topic: topic.clone(),
                }
            }
            TopicEvent::Detached => {
                self.session.store().topic_set_attached(topic, false).await?;
                info!("Detached from {}", topic);
                ClientEvent::Detached {
                    topic: topic.clone(),
                }
            }
            TopicEvent::AttachFailed { error } => ClientEvent::AttachFailed {
                topic: topic.clone(),
                error,
            },
        };
        self.session.emit(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::transport::MockTransport;
    use std::sync::Arc;
    use tidings_sync_store::{MemoryStore, MessageStore};
    use tidings_sync_types::{Content, Ctrl, CtrlParams, Seq, ServerMessage, UserId};

    fn grp1() -> TopicName {
        TopicName::new("grp1")
    }

    fn session(transport: MockTransport) -> Session<MockTransport> {
        Session::new(Arc::new(MemoryStore::new()), transport, ClientConfig::default())
    }

    fn reply(msg: &ClientMessage, code: u16, seq: Option<u64>) -> ServerMessage {
        ServerMessage::Ctrl(Ctrl {
            id: msg.id().map(str::to_owned),
            topic: Some(msg.topic().clone()),
            code,
            text: "status".into(),
            ts: 0,
            params: CtrlParams {
                seq: seq.map(Seq::new),
                url: None,
            },
        })
    }

    /// Accepts everything; publishes get consecutive seqs from 100.
    fn accept_all() -> impl FnMut(&ClientMessage) -> Vec<ServerMessage> {
        let mut next_seq = 100;
        move |msg| match msg {
            ClientMessage::Pub(_) => {
                next_seq += 1;
                vec![reply(msg, 200, Some(next_seq))]
            }
            ClientMessage::Note(_) => vec![],
            _ => vec![reply(msg, 200, None)],
        }
    }

    #[tokio::test]
    async fn attach_subscribes_with_cache_point() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_all());
        let session = session(transport.clone());
        session
            .store()
            .msg_received(&grp1(), Seq::new(41), &UserId::new("usrBob"), &Content::text("x"), 1)
            .await
            .unwrap();

        session.topics().attach(&grp1()).await.unwrap();

        assert!(session.is_attached(&grp1()));
        let topic = session.store().topic_get(&grp1()).await.unwrap().unwrap();
        assert!(topic.attached);
        let sent = transport.sent_client_messages();
        let ClientMessage::Sub(sub) = &sent[0] else {
            panic!("expected subscribe");
        };
        let query = sub.get.clone().unwrap();
        assert!(query.desc && query.sub && query.del);
        assert_eq!(query.data.unwrap().since, Some(Seq::new(41)));
    }

    #[tokio::test]
    async fn attach_twice_is_noop() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_all());
        let session = session(transport.clone());

        session.topics().attach(&grp1()).await.unwrap();
        session.topics().attach(&grp1()).await.unwrap();

        assert_eq!(transport.sent_client_messages().len(), 1);
    }

    #[tokio::test]
    async fn rejected_subscribe_surfaces_error() {
        let transport = MockTransport::connected();
        transport.set_responder(|msg| vec![reply(msg, 403, None)]);
        let session = session(transport.clone());
        let mut events = session.subscribe();

        let err = session.topics().attach(&grp1()).await.unwrap_err();

        assert!(matches!(err, ClientError::ServerRejected { code: 403, .. }));
        assert_eq!(session.attach_state(&grp1()), AttachState::Detached);
        assert_eq!(transport.reconnect_requests(), 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            ClientEvent::AttachFailed { .. }
        ));
    }

    #[tokio::test]
    async fn unstored_attach_flag_leaves_topic_detached() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_all());
        let store = MemoryStore::new();
        let session = Session::new(
            Arc::new(store.clone()),
            transport.clone(),
            ClientConfig::default(),
        );
        session
            .lifecycle()
            .create_ready(&grp1(), &Content::text("queued"))
            .await
            .unwrap();

        store.set_fail_writes(true);
        let err = session.topics().attach(&grp1()).await.unwrap_err();
        assert!(matches!(err, ClientError::StoreWriteFailed(_)));
        assert_eq!(session.attach_state(&grp1()), AttachState::Detached);
        store.set_fail_writes(false);

        session.topics().attach(&grp1()).await.unwrap();

        let subs = transport
            .sent_client_messages()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Sub(_)))
            .count();
        assert_eq!(subs, 2);
        assert!(store.queued_messages(&grp1()).await.unwrap().is_empty());
        assert!(store.topic_get(&grp1()).await.unwrap().unwrap().attached);
    }

    #[tokio::test]
    async fn flush_sends_in_creation_order() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_all());
        let session = session(transport.clone());
        let lifecycle = session.lifecycle();
        let a = lifecycle.create_ready(&grp1(), &Content::text("a")).await.unwrap();
        let b = lifecycle.create_ready(&grp1(), &Content::text("b")).await.unwrap();

        let report = session.topics().flush(&grp1()).await.unwrap();

        assert_eq!(report.sent, vec![a, b]);
        let texts: Vec<String> = transport
            .sent_client_messages()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Pub(p) => p.content.as_text().map(str::to_owned),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn flush_sends_pending_deletes() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_all());
        let session = session(transport.clone());
        let store = session.store();
        for seq in [3, 4] {
            store
                .msg_received(
                    &grp1(),
                    Seq::new(seq),
                    &UserId::new("usrBob"),
                    &Content::text("x"),
                    1,
                )
                .await
                .unwrap();
        }
        let target = DeleteTarget::from_seqs(vec![Seq::new(3), Seq::new(4)]).unwrap();
        session.lifecycle().mark_for_delete(&grp1(), &target, true).await.unwrap();

        session.topics().flush(&grp1()).await.unwrap();

        assert!(store.queued_deletes(&grp1(), true).await.unwrap().is_empty());
        assert!(transport
            .sent_client_messages()
            .iter()
            .any(|m| matches!(m, ClientMessage::Del(Del { hard: true, .. }))));
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_all());
        let session = session(transport.clone());

        session.topics().detach(&grp1()).await.unwrap();
        assert!(transport.sent_messages().is_empty());

        session.topics().attach(&grp1()).await.unwrap();
        session.topics().detach(&grp1()).await.unwrap();
        session.topics().detach(&grp1()).await.unwrap();

        assert!(!session.is_attached(&grp1()));
        let leaves = transport
            .sent_client_messages()
            .iter()
            .filter(|m| matches!(m, ClientMessage::Leave(_)))
            .count();
        assert_eq!(leaves, 1);
        let topic = session.store().topic_get(&grp1()).await.unwrap().unwrap();
        assert!(!topic.attached);
    }

    #[tokio::test]
    async fn disconnect_detaches_all() {
        let transport = MockTransport::connected();
        transport.set_responder(accept_all());
        let session = session(transport.clone());
        session.topics().attach(&grp1()).await.unwrap();
        session.topics().attach(&TopicName::new("p2p")).await.unwrap();

        transport.drop_connection();
        session.topics().on_disconnect().await.unwrap();

        assert!(!session.is_attached(&grp1()));
        assert!(!session.is_attached(&TopicName::new("p2p")));
    }
}
