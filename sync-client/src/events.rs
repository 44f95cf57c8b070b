//! Events delivered to the presentation layer.

use tidings_sync_types::{DbId, Message, Seq, SeqRange, TopicName, UserId};

/// Something the presentation layer may want to re-render.
///
/// Delivered through a broadcast channel; see [`crate::ChatClient::events`].
/// A lagging receiver loses the oldest events, never blocks the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The visible window of a topic, newest first.
    MessagesLoaded {
        /// Topic.
        topic: TopicName,
        /// Window contents.
        messages: Vec<Message>,
    },
    /// Delivery ticks changed for the messages in `range`.
    Refresh {
        /// Topic.
        topic: TopicName,
        /// Affected sequence range.
        range: SeqRange,
    },
    /// Delivery ticks changed for every cached message.
    RefreshAll {
        /// Topic.
        topic: TopicName,
    },
    /// A peer is typing.
    Typing {
        /// Topic.
        topic: TopicName,
        /// Peer.
        from: UserId,
    },
    /// Topic presence changed.
    Presence {
        /// Topic.
        topic: TopicName,
        /// Online flag.
        online: bool,
    },
    /// A message arrived from the server.
    MessageReceived {
        /// Topic.
        topic: TopicName,
        /// Local id.
        id: DbId,
        /// Server sequence.
        seq: Seq,
    },
    /// An outgoing message was confirmed.
    MessageSynced {
        /// Topic.
        topic: TopicName,
        /// Local id.
        id: DbId,
        /// Assigned server sequence.
        seq: Seq,
    },
    /// An outgoing message could not be transmitted and is queued again.
    SendFailed {
        /// Topic.
        topic: TopicName,
        /// Local id.
        id: DbId,
        /// Error text.
        error: String,
    },
    /// Attachment upload progress.
    UploadProgress {
        /// Topic.
        topic: TopicName,
        /// Local id of the draft carrying the attachment.
        id: DbId,
        /// Bytes sent so far.
        sent: u64,
        /// Total bytes.
        total: u64,
    },
    /// The topic is attached.
    Attached {
        /// Topic.
        topic: TopicName,
    },
    /// Attaching failed.
    AttachFailed {
        /// Topic.
        topic: TopicName,
        /// Error text.
        error: String,
    },
    /// The topic is detached.
    Detached {
        /// Topic.
        topic: TopicName,
    },
}

impl ClientEvent {
    /// Topic the event concerns.
    pub fn topic(&self) -> &TopicName {
        match self {
            Self::MessagesLoaded { topic, .. }
            | Self::Refresh { topic, .. }
            | Self::RefreshAll { topic }
            | Self::Typing { topic, .. }
            | Self::Presence { topic, .. }
            | Self::MessageReceived { topic, .. }
            | Self::MessageSynced { topic, .. }
            | Self::SendFailed { topic, .. }
            | Self::UploadProgress { topic, .. }
            | Self::Attached { topic }
            | Self::AttachFailed { topic, .. }
            | Self::Detached { topic } => topic,
        }
    }
}
