//! In-memory storage backend for sync-store.
//!
//! Holds every record in ordered maps behind one async mutex, so each call is
//! atomic. Nothing survives the process. Writes can be made to fail on
//! demand, which lets engine tests exercise store-failure paths.

use crate::{MessageStore, RecoveryReport, StoreError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tidings_sync_core::{apply, Effect, Transition};
use tidings_sync_types::{
    CachedRange, Content, DbId, DeleteTarget, Message, MessageState, Seq, SeqRange, Subscription,
    Timestamp, Topic, TopicName, User, UserId,
};
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    next_id: i64,
    topics: BTreeMap<TopicName, Topic>,
    messages: BTreeMap<DbId, Message>,
    subs: BTreeMap<(TopicName, UserId), Subscription>,
    users: HashMap<UserId, User>,
}

impl Inner {
    fn topic_mut(&mut self, name: &TopicName) -> &mut Topic {
        self.topics
            .entry(name.clone())
            .or_insert_with(|| Topic::new(name.clone()))
    }

    fn insert(&mut self, mut msg: Message) -> DbId {
        self.next_id += 1;
        let id = DbId::new(self.next_id);
        msg.id = id;
        self.topic_mut(&msg.topic);
        self.messages.insert(id, msg);
        id
    }

    fn raise_max_seq(&mut self, name: &TopicName, seq: Seq) {
        let topic = self.topic_mut(name);
        if topic.max_seq.map_or(true, |max| max < seq) {
            topic.max_seq = Some(seq);
        }
    }

    fn find_seq(&self, topic: &TopicName, seq: Seq) -> Option<DbId> {
        self.messages
            .values()
            .find(|m| &m.topic == topic && m.seq == Some(seq))
            .map(|m| m.id)
    }

    fn topic_messages<'a>(
        &'a self,
        topic: &'a TopicName,
    ) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages.values().filter(move |m| &m.topic == topic)
    }

    fn transition(
        &mut self,
        topic: &TopicName,
        id: DbId,
        transition: Transition,
    ) -> Result<Effect, StoreError> {
        let msg = self
            .messages
            .get_mut(&id)
            .filter(|m| &m.topic == topic)
            .ok_or_else(|| StoreError::NotFound {
                topic: topic.to_string(),
                id: id.value(),
            })?;

        // Work on a copy so a rejection leaves the stored row untouched.
        let mut next = msg.clone();
        let effect = apply(&mut next, transition)?;
        match effect {
            Effect::Updated => *msg = next,
            Effect::Removed => {
                self.messages.remove(&id);
            }
            Effect::Unchanged => {}
        }
        Ok(effect)
    }

    fn delete_matching(
        &mut self,
        topic: &TopicName,
        target: &DeleteTarget,
        transition: Transition,
    ) -> Result<u64, StoreError> {
        let mut staged = Vec::new();
        for msg in self.topic_messages(topic) {
            if !msg.seq.is_some_and(|seq| target.contains(seq)) {
                continue;
            }
            let mut next = msg.clone();
            if apply(&mut next, transition.clone())? == Effect::Updated {
                staged.push(next);
            }
        }

        let changed = staged.len() as u64;
        for msg in staged {
            self.messages.insert(msg.id, msg);
        }
        Ok(changed)
    }
}

/// In-memory message store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Backend`].
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write rejected".into()));
        }
        Ok(())
    }

    async fn create(
        &self,
        topic: &TopicName,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
        state: MessageState,
    ) -> Result<DbId, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.insert(Message {
            id: DbId::new(0),
            topic: topic.clone(),
            seq: None,
            from: from.clone(),
            content: content.clone(),
            ts,
            state,
            pending_delete: false,
        }))
    }

    async fn advance_peer(
        &self,
        topic: &TopicName,
        user: &UserId,
        seq: Seq,
        read: bool,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let sub = inner
            .subs
            .entry((topic.clone(), user.clone()))
            .or_insert_with(|| Subscription {
                topic: topic.clone(),
                user: user.clone(),
                recv: None,
                read: None,
                mode: String::new(),
                updated: 0,
            });
        let slot = if read { &mut sub.read } else { &mut sub.recv };
        Ok(advance(slot, seq))
    }
}

fn advance(slot: &mut Option<Seq>, seq: Seq) -> bool {
    if slot.map_or(true, |old| old < seq) {
        *slot = Some(seq);
        true
    } else {
        false
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn topic_upsert(&self, topic: &Topic) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner.topics.insert(topic.name.clone(), topic.clone());
        Ok(())
    }

    async fn topic_get(&self, name: &TopicName) -> Result<Option<Topic>, StoreError> {
        Ok(self.inner.lock().await.topics.get(name).cloned())
    }

    async fn topic_get_all(&self) -> Result<Vec<Topic>, StoreError> {
        Ok(self.inner.lock().await.topics.values().cloned().collect())
    }

    async fn topic_delete(&self, name: &TopicName) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner.topics.remove(name);
        inner.messages.retain(|_, m| &m.topic != name);
        inner.subs.retain(|(topic, _), _| topic != name);
        Ok(())
    }

    async fn topic_set_attached(&self, name: &TopicName, attached: bool) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().await.topic_mut(name).attached = attached;
        Ok(())
    }

    async fn topic_set_online(&self, name: &TopicName, online: bool) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().await.topic_mut(name).online = online;
        Ok(())
    }

    async fn topic_set_max_seq(&self, name: &TopicName, seq: Seq) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().await.raise_max_seq(name, seq);
        Ok(())
    }

    async fn set_read(&self, name: &TopicName, seq: Seq) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        Ok(advance(&mut inner.topic_mut(name).read, seq))
    }

    async fn set_recv(&self, name: &TopicName, seq: Seq) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        Ok(advance(&mut inner.topic_mut(name).recv, seq))
    }

    async fn set_all_loaded(&self, name: &TopicName, loaded: bool) -> Result<(), StoreError> {
        self.check_writable()?;
        self.inner.lock().await.topic_mut(name).all_loaded = loaded;
        Ok(())
    }

    async fn cached_range(&self, name: &TopicName) -> Result<Option<CachedRange>, StoreError> {
        let inner = self.inner.lock().await;
        let seqs = inner.topic_messages(name).filter_map(|m| m.seq);
        let (min, max) = seqs.fold((None, None), |(min, max): (Option<Seq>, Option<Seq>), s| {
            (Some(min.map_or(s, |m| m.min(s))), Some(max.map_or(s, |m| m.max(s))))
        });
        Ok(min.zip(max).map(|(min, max)| SeqRange::new(min, max)))
    }

    async fn sub_upsert(&self, sub: &Subscription) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner
            .subs
            .insert((sub.topic.clone(), sub.user.clone()), sub.clone());
        Ok(())
    }

    async fn sub_get_all(&self, topic: &TopicName) -> Result<Vec<Subscription>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subs
            .values()
            .filter(|s| &s.topic == topic)
            .cloned()
            .collect())
    }

    async fn sub_delete(&self, topic: &TopicName, user: &UserId) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner.subs.remove(&(topic.clone(), user.clone()));
        Ok(())
    }

    async fn msg_recv_by_remote(
        &self,
        topic: &TopicName,
        user: &UserId,
        seq: Seq,
    ) -> Result<bool, StoreError> {
        self.advance_peer(topic, user, seq, false).await
    }

    async fn msg_read_by_remote(
        &self,
        topic: &TopicName,
        user: &UserId,
        seq: Seq,
    ) -> Result<bool, StoreError> {
        self.advance_peer(topic, user, seq, true).await
    }

    async fn user_get(&self, uid: &UserId) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().await.users.get(uid).cloned())
    }

    async fn user_upsert(&self, user: &User) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        inner.users.insert(user.uid.clone(), user.clone());
        Ok(())
    }

    async fn msg_received(
        &self,
        topic: &TopicName,
        seq: Seq,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;

        let id = match inner.find_seq(topic, seq) {
            Some(id) => {
                if let Some(msg) = inner.messages.get_mut(&id) {
                    if !msg.state.is_deleted() {
                        msg.from = from.clone();
                        msg.content = content.clone();
                        msg.ts = ts;
                    }
                }
                id
            }
            None => inner.insert(Message {
                id: DbId::new(0),
                topic: topic.clone(),
                seq: Some(seq),
                from: from.clone(),
                content: content.clone(),
                ts,
                state: MessageState::Synced,
                pending_delete: false,
            }),
        };

        inner.raise_max_seq(topic, seq);
        Ok(id)
    }

    async fn msg_draft(
        &self,
        topic: &TopicName,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError> {
        self.create(topic, from, content, ts, MessageState::Draft).await
    }

    async fn msg_send(
        &self,
        topic: &TopicName,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError> {
        self.create(topic, from, content, ts, MessageState::Ready).await
    }

    async fn msg_get(&self, topic: &TopicName, id: DbId) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.messages.get(&id).filter(|m| &m.topic == topic).cloned())
    }

    async fn msg_transition(
        &self,
        topic: &TopicName,
        id: DbId,
        transition: Transition,
    ) -> Result<Effect, StoreError> {
        self.check_writable()?;
        self.inner.lock().await.transition(topic, id, transition)
    }

    async fn msg_delivered(
        &self,
        topic: &TopicName,
        id: DbId,
        seq: Seq,
        ts: Timestamp,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;

        let echo = match inner.find_seq(topic, seq).filter(|other| *other != id) {
            Some(other) => {
                let synced = inner
                    .messages
                    .get(&other)
                    .is_some_and(|m| m.state == MessageState::Synced);
                if !synced {
                    return Err(StoreError::DuplicateSeq {
                        topic: topic.to_string(),
                        seq: seq.value(),
                    });
                }
                inner.messages.remove(&other)
            }
            None => None,
        };

        if let Err(err) = inner.transition(topic, id, Transition::Confirm { seq, ts }) {
            // Put the echo back; nothing changes on failure.
            if let Some(echo) = echo {
                inner.messages.insert(echo.id, echo);
            }
            return Err(err);
        }
        if let Some(echo) = echo {
            tracing::debug!("Folding echo {:?} of {} into {:?}", echo.id, seq, id);
        }

        inner.raise_max_seq(topic, seq);
        Ok(())
    }

    async fn msg_mark_to_delete(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        hard: bool,
    ) -> Result<u64, StoreError> {
        self.check_writable()?;
        self.inner
            .lock()
            .await
            .delete_matching(topic, target, Transition::MarkDeleted { hard })
    }

    async fn msg_apply_delete(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        hard: bool,
    ) -> Result<u64, StoreError> {
        self.check_writable()?;
        self.inner
            .lock()
            .await
            .delete_matching(topic, target, Transition::ApplyDelete { hard })
    }

    async fn msg_query(&self, topic: &TopicName, limit: u64) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        let mut msgs: Vec<Message> = inner
            .topic_messages(topic)
            .filter(|m| m.state != MessageState::HardDeleted)
            .cloned()
            .collect();

        // Unsynced (no seq) first, then seq descending, ties by id descending.
        msgs.sort_by(|a, b| {
            b.seq
                .is_none()
                .cmp(&a.seq.is_none())
                .then(b.seq.cmp(&a.seq))
                .then(b.id.cmp(&a.id))
        });
        msgs.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(msgs)
    }

    async fn msg_range(
        &self,
        topic: &TopicName,
        range: SeqRange,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        let mut msgs: Vec<Message> = inner
            .topic_messages(topic)
            .filter(|m| m.state != MessageState::HardDeleted)
            .filter(|m| m.seq.is_some_and(|s| range.contains(s)))
            .cloned()
            .collect();
        msgs.sort_by_key(|m| m.seq);
        Ok(msgs)
    }

    async fn msg_count(&self, topic: &TopicName) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .topic_messages(topic)
            .filter(|m| m.state != MessageState::HardDeleted)
            .count() as u64)
    }

    async fn queued_messages(&self, topic: &TopicName) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().await;
        // BTreeMap iteration is already ascending by id.
        Ok(inner
            .topic_messages(topic)
            .filter(|m| m.state == MessageState::Ready)
            .cloned()
            .collect())
    }

    async fn queued_deletes(&self, topic: &TopicName, hard: bool) -> Result<Vec<Seq>, StoreError> {
        let state = if hard {
            MessageState::HardDeleted
        } else {
            MessageState::SoftDeleted
        };
        let inner = self.inner.lock().await;
        let mut seqs: Vec<Seq> = inner
            .topic_messages(topic)
            .filter(|m| m.pending_delete && m.state == state)
            .filter_map(|m| m.seq)
            .collect();
        seqs.sort();
        Ok(seqs)
    }

    async fn recover(&self) -> Result<RecoveryReport, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        let mut report = RecoveryReport::default();

        for msg in inner.messages.values_mut() {
            if msg.state == MessageState::Syncing {
                msg.state = MessageState::Ready;
                report.reset_syncing += 1;
            }
        }
        for topic in inner.topics.values_mut() {
            if topic.attached {
                topic.attached = false;
                report.detached_topics += 1;
            }
        }

        tracing::info!(
            "Recovered store: {} in-flight message(s) reset, {} topic(s) detached",
            report.reset_syncing,
            report.detached_topics
        );
        Ok(report)
    }
}
