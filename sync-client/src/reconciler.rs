//! Watermark reconciliation.
//!
//! Peer info events move the topic's recv/read watermarks forward and tell
//! the presentation layer which cached messages need their delivery ticks
//! redrawn. Watermarks are re-read from the store on every event, so the
//! reconciler keeps no state of its own.
//!
//! The local user's own receipts live in the local user's subscription
//! record. They never touch the topic watermarks, so a peer receipt for a
//! message we already acknowledged still refreshes its ticks.

use tidings_sync_core::{Refresh, WatermarkTracker};
use tidings_sync_types::{
    InfoEvent, InfoWhat, Note, NoteWhat, Seq, SubDesc, Subscription, TopicDesc, TopicName, User,
    UserId, WatermarkKind,
};
use tracing::debug;

use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::session::Session;
use crate::transport::Transport;

/// Applies watermark and typing signals for a session.
pub struct Reconciler<'a, T: Transport> {
    session: &'a Session<T>,
}

impl<'a, T: Transport> Reconciler<'a, T> {
    pub(crate) fn new(session: &'a Session<T>) -> Self {
        Self { session }
    }

    /// Apply a server info event.
    ///
    /// Returns what the presentation layer was told to refresh. Stale and
    /// duplicate events return [`Refresh::None`] and change nothing.
    pub async fn on_info(&self, info: &InfoEvent) -> Result<Refresh, ClientError> {
        let kind = match info.what {
            InfoWhat::Kp => {
                if info.from != *self.session.user() {
                    self.session.emit(ClientEvent::Typing {
                        topic: info.topic.clone(),
                        from: info.from.clone(),
                    });
                }
                return Ok(Refresh::None);
            }
            InfoWhat::Recv => WatermarkKind::Recv,
            InfoWhat::Read => WatermarkKind::Read,
        };
        let Some(seq) = info.seq else {
            return Ok(Refresh::None);
        };

        self.sub_watermark(&info.topic, &info.from, kind, seq).await?;
        if info.from == *self.session.user() {
            // Our own receipt, echoed from another session.
            return Ok(Refresh::None);
        }
        self.observe(&info.topic, kind, seq).await
    }

    /// Advance the topic's peer watermark of `kind` to `seq` and report the
    /// refresh.
    pub async fn observe(
        &self,
        topic: &TopicName,
        kind: WatermarkKind,
        seq: Seq,
    ) -> Result<Refresh, ClientError> {
        let store = self.session.store();
        let mut tracker = match store.topic_get(topic).await? {
            Some(t) => WatermarkTracker::with_watermarks(t.recv, t.read),
            None => WatermarkTracker::new(),
        };

        let refresh = tracker.observe(kind, Some(seq));
        if refresh == Refresh::None {
            return Ok(Refresh::None);
        }

        // A concurrent event may have moved it first.
        if !self.store_watermark(topic, kind, seq).await? {
            return Ok(Refresh::None);
        }
        debug!("Topic {} {:?} watermark -> {}", topic, kind, seq);

        match refresh {
            Refresh::All => self.session.emit(ClientEvent::RefreshAll {
                topic: topic.clone(),
            }),
            Refresh::Range(range) => self.session.emit(ClientEvent::Refresh {
                topic: topic.clone(),
                range,
            }),
            Refresh::None => {}
        }
        Ok(refresh)
    }

    /// Apply a topic description from the server.
    ///
    /// The description's recv/read are the local user's own receipts.
    pub async fn apply_desc(&self, topic: &TopicName, desc: &TopicDesc) -> Result<(), ClientError> {
        let store = self.session.store();
        let me = self.session.user();
        if let Some(seq) = desc.recv {
            self.sub_watermark(topic, me, WatermarkKind::Recv, seq).await?;
        }
        if let Some(seq) = desc.read {
            self.sub_watermark(topic, me, WatermarkKind::Read, seq).await?;
        }
        if let Some(seq) = desc.seq {
            store.topic_set_max_seq(topic, seq).await?;
        }
        Ok(())
    }

    /// Apply the subscriber list from the server.
    pub async fn apply_subs(&self, topic: &TopicName, subs: &[SubDesc]) -> Result<(), ClientError> {
        let store = self.session.store();
        for sub in subs {
            store
                .sub_upsert(&Subscription {
                    topic: topic.clone(),
                    user: sub.user.clone(),
                    recv: sub.recv,
                    read: sub.read,
                    mode: sub.mode.clone(),
                    updated: sub.updated,
                })
                .await?;
            if let Some(public) = &sub.public {
                store
                    .user_upsert(&User {
                        uid: sub.user.clone(),
                        public: public.clone(),
                        updated: sub.updated,
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Mark messages up to `seq` as read by the local user.
    ///
    /// The server is notified only when the watermark actually moves.
    pub async fn note_read(&self, topic: &TopicName, seq: Seq) -> Result<bool, ClientError> {
        self.note(topic, WatermarkKind::Read, seq).await
    }

    /// Mark messages up to `seq` as received by the local user.
    pub async fn note_recv(&self, topic: &TopicName, seq: Seq) -> Result<bool, ClientError> {
        self.note(topic, WatermarkKind::Recv, seq).await
    }

    /// Tell peers the local user is typing.
    pub async fn note_typing(&self, topic: &TopicName) -> Result<(), ClientError> {
        self.session
            .notify(Note {
                topic: topic.clone(),
                what: NoteWhat::Kp,
                seq: None,
            })
            .await
    }

    async fn note(
        &self,
        topic: &TopicName,
        kind: WatermarkKind,
        seq: Seq,
    ) -> Result<bool, ClientError> {
        let me = self.session.user();
        if !self.sub_watermark(topic, me, kind, seq).await? {
            return Ok(false);
        }
        let what = match kind {
            WatermarkKind::Recv => NoteWhat::Recv,
            WatermarkKind::Read => NoteWhat::Read,
        };
        self.session
            .notify(Note {
                topic: topic.clone(),
                what,
                seq: Some(seq),
            })
            .await?;
        Ok(true)
    }

    async fn store_watermark(
        &self,
        topic: &TopicName,
        kind: WatermarkKind,
        seq: Seq,
    ) -> Result<bool, ClientError> {
        let store = self.session.store();
        let moved = match kind {
            WatermarkKind::Recv => store.set_recv(topic, seq).await?,
            WatermarkKind::Read => store.set_read(topic, seq).await?,
        };
        Ok(moved)
    }

    /// Advance the watermark in `user`'s subscription record.
    async fn sub_watermark(
        &self,
        topic: &TopicName,
        user: &UserId,
        kind: WatermarkKind,
        seq: Seq,
    ) -> Result<bool, ClientError> {
        let store = self.session.store();
        let moved = match kind {
            WatermarkKind::Recv => store.msg_recv_by_remote(topic, user, seq).await?,
            WatermarkKind::Read => store.msg_read_by_remote(topic, user, seq).await?,
        };
        Ok(moved)
    }
}
