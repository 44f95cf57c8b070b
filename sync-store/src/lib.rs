//! # sync-store
//!
//! Persistent message store for tidings.
//!
//! The [`MessageStore`] trait is the contract the sync engine consumes.
//! Every read-modify-write of a message row goes through the pure
//! transition table in `sync-core`, inside one transaction per call, so a
//! rejected transition or a failed write never leaves a partial state.
//!
//! Two backends are provided:
//! - [`SqliteStore`] - durable storage via sqlx (WAL mode)
//! - [`MemoryStore`] - in-process maps, for tests and ephemeral sessions

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod memory;
mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use tidings_sync_core::{Effect, Transition};
use tidings_sync_types::{
    CachedRange, Content, DbId, DeleteTarget, Message, Seq, SeqRange, Subscription, Timestamp,
    Topic, TopicName, User, UserId,
};

/// What startup recovery changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Messages found in `Syncing` and reset to `Ready`.
    pub reset_syncing: u64,
    /// Topics whose `attached` flag was cleared.
    pub detached_topics: u64,
}

/// Storage contract for the sync engine.
///
/// Implementations must be safe to share across tasks. Methods that change
/// message state are atomic per call.
#[async_trait]
pub trait MessageStore: Send + Sync {
    // ===== Topics =====

    /// Insert or replace a topic record.
    async fn topic_upsert(&self, topic: &Topic) -> Result<(), StoreError>;

    /// Get a topic by name.
    async fn topic_get(&self, name: &TopicName) -> Result<Option<Topic>, StoreError>;

    /// All known topics, ordered by name.
    async fn topic_get_all(&self) -> Result<Vec<Topic>, StoreError>;

    /// Remove a topic with its messages and subscriptions.
    async fn topic_delete(&self, name: &TopicName) -> Result<(), StoreError>;

    /// Set the attached flag. Creates the topic if unknown.
    async fn topic_set_attached(&self, name: &TopicName, attached: bool) -> Result<(), StoreError>;

    /// Set the presence flag. Creates the topic if unknown.
    async fn topic_set_online(&self, name: &TopicName, online: bool) -> Result<(), StoreError>;

    /// Raise the highest known server seq. Lower values are ignored.
    async fn topic_set_max_seq(&self, name: &TopicName, seq: Seq) -> Result<(), StoreError>;

    /// Advance the local read watermark.
    ///
    /// Returns `false` (and changes nothing) unless `seq` is higher than the
    /// stored value.
    async fn set_read(&self, name: &TopicName, seq: Seq) -> Result<bool, StoreError>;

    /// Advance the local received watermark. Same rules as [`set_read`](Self::set_read).
    async fn set_recv(&self, name: &TopicName, seq: Seq) -> Result<bool, StoreError>;

    /// Record whether the full remote history has been fetched.
    async fn set_all_loaded(&self, name: &TopicName, loaded: bool) -> Result<(), StoreError>;

    /// Span of sequence numbers cached for a topic.
    async fn cached_range(&self, name: &TopicName) -> Result<Option<CachedRange>, StoreError>;

    // ===== Subscriptions =====

    /// Insert or replace a peer subscription.
    async fn sub_upsert(&self, sub: &Subscription) -> Result<(), StoreError>;

    /// All subscriptions of a topic, ordered by user.
    async fn sub_get_all(&self, topic: &TopicName) -> Result<Vec<Subscription>, StoreError>;

    /// Remove a peer subscription.
    async fn sub_delete(&self, topic: &TopicName, user: &UserId) -> Result<(), StoreError>;

    /// Advance a peer's received watermark. Returns `true` if it moved.
    async fn msg_recv_by_remote(
        &self,
        topic: &TopicName,
        user: &UserId,
        seq: Seq,
    ) -> Result<bool, StoreError>;

    /// Advance a peer's read watermark. Returns `true` if it moved.
    async fn msg_read_by_remote(
        &self,
        topic: &TopicName,
        user: &UserId,
        seq: Seq,
    ) -> Result<bool, StoreError>;

    // ===== Users =====

    /// Get a user by id.
    async fn user_get(&self, uid: &UserId) -> Result<Option<User>, StoreError>;

    /// Insert or replace a user.
    async fn user_upsert(&self, user: &User) -> Result<(), StoreError>;

    // ===== Messages =====

    /// Store a message delivered by the server.
    ///
    /// Updates the existing row with the same `(topic, seq)` instead of
    /// inserting a duplicate. Deleted rows are left as they are. Raises the
    /// topic's max seq.
    async fn msg_received(
        &self,
        topic: &TopicName,
        seq: Seq,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError>;

    /// Create a message in `Draft`.
    async fn msg_draft(
        &self,
        topic: &TopicName,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError>;

    /// Create a message in `Ready`.
    async fn msg_send(
        &self,
        topic: &TopicName,
        from: &UserId,
        content: &Content,
        ts: Timestamp,
    ) -> Result<DbId, StoreError>;

    /// Get a message by local id.
    async fn msg_get(&self, topic: &TopicName, id: DbId) -> Result<Option<Message>, StoreError>;

    /// Apply a lifecycle transition to one message atomically.
    async fn msg_transition(
        &self,
        topic: &TopicName,
        id: DbId,
        transition: Transition,
    ) -> Result<Effect, StoreError>;

    /// Remove a never-synced message.
    async fn msg_discard(&self, topic: &TopicName, id: DbId) -> Result<(), StoreError> {
        self.msg_transition(topic, id, Transition::Discard).await.map(|_| ())
    }

    /// Confirm an in-flight message with its server seq and timestamp.
    ///
    /// A `Synced` row already holding `seq` is the server's echo of this
    /// message and is folded into it. Any other row holding `seq` is a
    /// [`StoreError::DuplicateSeq`].
    async fn msg_delivered(
        &self,
        topic: &TopicName,
        id: DbId,
        seq: Seq,
        ts: Timestamp,
    ) -> Result<(), StoreError>;

    /// Record a local delete of every cached message in `target`.
    ///
    /// Returns the number of rows changed.
    async fn msg_mark_to_delete(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        hard: bool,
    ) -> Result<u64, StoreError>;

    /// Apply a server-confirmed delete to every cached message in `target`.
    ///
    /// Returns the number of rows changed.
    async fn msg_apply_delete(
        &self,
        topic: &TopicName,
        target: &DeleteTarget,
        hard: bool,
    ) -> Result<u64, StoreError>;

    /// Newest `limit` messages of a topic, hard-deleted rows excluded.
    ///
    /// Unsynced rows come first by id descending, then synced rows by seq
    /// descending.
    async fn msg_query(&self, topic: &TopicName, limit: u64) -> Result<Vec<Message>, StoreError>;

    /// Cached messages with a seq inside `range`, ascending.
    async fn msg_range(
        &self,
        topic: &TopicName,
        range: SeqRange,
    ) -> Result<Vec<Message>, StoreError>;

    /// Number of cached messages, hard-deleted rows excluded.
    async fn msg_count(&self, topic: &TopicName) -> Result<u64, StoreError>;

    /// Messages in `Ready`, ascending local id.
    async fn queued_messages(&self, topic: &TopicName) -> Result<Vec<Message>, StoreError>;

    /// Seqs with an unconfirmed delete of the given kind, ascending.
    async fn queued_deletes(&self, topic: &TopicName, hard: bool) -> Result<Vec<Seq>, StoreError>;

    // ===== Recovery =====

    /// Startup recovery: reset `Syncing` rows to `Ready` and clear every
    /// topic's attached flag. Run before any attach.
    async fn recover(&self) -> Result<RecoveryReport, StoreError>;
}
