//! Wire messages exchanged with the server.
//!
//! Requests carry a client-chosen `id`; the server answers each with a
//! [`Ctrl`] frame echoing it. Data, meta, info and presence frames may
//! arrive at any time, including in between a request and its `Ctrl`.

use serde::{Deserialize, Serialize};

use crate::{Content, DeleteTarget, Seq, SeqRange, SyncError, Timestamp, TopicName, UserId};

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Subscribe (attach) to a topic.
    Sub(Sub),
    /// Unsubscribe (detach) from a topic.
    Leave(Leave),
    /// Publish a message.
    Pub(Pub),
    /// Query topic metadata or history.
    Get(Get),
    /// Delete messages.
    Del(Del),
    /// Fire-and-forget notification (recv/read/typing).
    Note(Note),
}

impl ClientMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// The request id, for frames that expect a `Ctrl` reply.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Sub(m) => Some(&m.id),
            Self::Leave(m) => Some(&m.id),
            Self::Pub(m) => Some(&m.id),
            Self::Get(m) => Some(&m.id),
            Self::Del(m) => Some(&m.id),
            Self::Note(_) => None,
        }
    }

    /// The topic this frame addresses.
    pub fn topic(&self) -> &TopicName {
        match self {
            Self::Sub(m) => &m.topic,
            Self::Leave(m) => &m.topic,
            Self::Pub(m) => &m.topic,
            Self::Get(m) => &m.topic,
            Self::Del(m) => &m.topic,
            Self::Note(m) => &m.topic,
        }
    }
}

/// Subscribe request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sub {
    /// Request id.
    pub id: String,
    /// Topic to attach to.
    pub topic: TopicName,
    /// Metadata to deliver along with the subscription.
    pub get: Option<MetaQuery>,
}

/// Leave request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leave {
    /// Request id.
    pub id: String,
    /// Topic to detach from.
    pub topic: TopicName,
}

/// Publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pub {
    /// Request id.
    pub id: String,
    /// Destination topic.
    pub topic: TopicName,
    /// Message payload.
    pub content: Content,
}

/// Metadata/history query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Get {
    /// Request id.
    pub id: String,
    /// Topic to query.
    pub topic: TopicName,
    /// What to fetch.
    pub query: MetaQuery,
}

/// Delete request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Del {
    /// Request id.
    pub id: String,
    /// Topic holding the messages.
    pub topic: TopicName,
    /// Messages to delete.
    pub target: DeleteTarget,
    /// Delete for everyone rather than only for the local user.
    pub hard: bool,
}

/// Notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteWhat {
    /// Messages up to `seq` were received.
    Recv,
    /// Messages up to `seq` were read.
    Read,
    /// The user is typing.
    Kp,
}

/// Notification frame; the server does not reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// Topic the notification applies to.
    pub topic: TopicName,
    /// Kind of notification.
    pub what: NoteWhat,
    /// Watermark value for recv/read.
    pub seq: Option<Seq>,
}

/// What a [`MetaQuery`] asks the server to deliver.
///
/// Built by chaining `with_*` calls:
///
/// ```
/// use tidings_sync_types::{MetaQuery, Seq};
///
/// let q = MetaQuery::new().with_desc().with_sub().with_data_since(Some(Seq::new(41))).with_del();
/// assert!(q.desc && q.sub && q.del);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaQuery {
    /// Topic description (watermarks, max seq).
    pub desc: bool,
    /// Subscriber list.
    pub sub: bool,
    /// Message data.
    pub data: Option<DataQuery>,
    /// Deletions.
    pub del: bool,
}

/// Message window of a [`MetaQuery`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQuery {
    /// Only messages with seq > since.
    pub since: Option<Seq>,
    /// Only messages with seq < before.
    pub before: Option<Seq>,
    /// At most this many messages, newest first.
    pub limit: Option<u32>,
}

impl MetaQuery {
    /// Empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the topic description.
    pub fn with_desc(mut self) -> Self {
        self.desc = true;
        self
    }

    /// Request the subscriber list.
    pub fn with_sub(mut self) -> Self {
        self.sub = true;
        self
    }

    /// Request messages newer than the local cache point.
    pub fn with_data_since(mut self, since: Option<Seq>) -> Self {
        self.data = Some(DataQuery {
            since,
            before: None,
            limit: None,
        });
        self
    }

    /// Request one page of messages older than `before`.
    pub fn with_earlier_data(mut self, before: Option<Seq>, limit: u32) -> Self {
        self.data = Some(DataQuery {
            since: None,
            before,
            limit: Some(limit),
        });
        self
    }

    /// Request deletions.
    pub fn with_del(mut self) -> Self {
        self.del = true;
        self
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Outcome of a request.
    Ctrl(Ctrl),
    /// A message.
    Data(DataEvent),
    /// Topic metadata.
    Meta(MetaEvent),
    /// Watermark or typing signal.
    Info(InfoEvent),
    /// Presence change.
    Pres(PresEvent),
}

impl ServerMessage {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        rmp_serde::to_vec_named(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        rmp_serde::from_slice(bytes).map_err(SyncError::Deserialization)
    }
}

/// Parameters attached to a [`Ctrl`] reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtrlParams {
    /// Sequence assigned to a published message.
    pub seq: Option<Seq>,
    /// Location of an uploaded file.
    pub url: Option<String>,
}

/// Outcome of a request. Codes below 300 are success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ctrl {
    /// Echoed request id.
    pub id: Option<String>,
    /// Topic the request addressed.
    pub topic: Option<TopicName>,
    /// HTTP-like status code.
    pub code: u16,
    /// Human readable status.
    pub text: String,
    /// Server time of the reply.
    pub ts: Timestamp,
    /// Extra values.
    pub params: CtrlParams,
}

impl Ctrl {
    /// Codes of 300 and above are logical failures.
    pub fn is_success(&self) -> bool {
        self.code < 300
    }
}

/// A message pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Topic holding the message.
    pub topic: TopicName,
    /// Server-assigned sequence.
    pub seq: Seq,
    /// Author.
    pub from: UserId,
    /// Payload.
    pub content: Content,
    /// Server timestamp.
    pub ts: Timestamp,
}

/// Kind of an [`InfoEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfoWhat {
    /// A peer received messages up to `seq`.
    Recv,
    /// A peer read messages up to `seq`.
    Read,
    /// A peer is typing.
    Kp,
}

/// Watermark or typing signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoEvent {
    /// Topic the signal applies to.
    pub topic: TopicName,
    /// Peer that produced the signal.
    pub from: UserId,
    /// Kind of signal.
    pub what: InfoWhat,
    /// Watermark value for recv/read.
    pub seq: Option<Seq>,
}

/// Kind of a [`PresEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresWhat {
    /// Peer came online.
    On,
    /// Peer went offline.
    Off,
}

/// Presence change for a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresEvent {
    /// Topic the change applies to.
    pub topic: TopicName,
    /// New presence.
    pub what: PresWhat,
}

/// Topic description in a [`MetaEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDesc {
    /// Local user's received watermark as known to the server.
    pub recv: Option<Seq>,
    /// Local user's read watermark as known to the server.
    pub read: Option<Seq>,
    /// Highest sequence in the topic.
    pub seq: Option<Seq>,
}

/// Subscriber record in a [`MetaEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDesc {
    /// Peer.
    pub user: UserId,
    /// Peer's received watermark.
    pub recv: Option<Seq>,
    /// Peer's read watermark.
    pub read: Option<Seq>,
    /// Access mode.
    pub mode: String,
    /// Last change.
    pub updated: Timestamp,
    /// Peer's public profile.
    pub public: Option<Content>,
}

/// Topic metadata delivered in answer to a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaEvent {
    /// Id of the request this answers.
    pub id: Option<String>,
    /// Topic described.
    pub topic: TopicName,
    /// Description, if requested.
    pub desc: Option<TopicDesc>,
    /// Subscribers, if requested.
    pub sub: Vec<SubDesc>,
    /// Deleted ranges, if requested.
    pub del: Vec<SeqRange>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_roundtrip() {
        let msg = ClientMessage::Sub(Sub {
            id: "7".into(),
            topic: TopicName::new("grp1"),
            get: Some(
                MetaQuery::new()
                    .with_desc()
                    .with_sub()
                    .with_data_since(Some(Seq::new(3)))
                    .with_del(),
            ),
        });
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(ClientMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn server_data_roundtrip_keeps_content() {
        let msg = ServerMessage::Data(DataEvent {
            topic: TopicName::new("grp1"),
            seq: Seq::new(12),
            from: UserId::new("usrB"),
            content: Content::text("hi"),
            ts: 1_700_000_000_000,
        });
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(ServerMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn garbage_fails_to_decode() {
        assert!(matches!(
            ServerMessage::from_bytes(&[0xc1, 0x00]),
            Err(SyncError::Deserialization(_))
        ));
    }

    #[test]
    fn ctrl_success_threshold() {
        let mut ctrl = Ctrl {
            id: Some("1".into()),
            topic: None,
            code: 200,
            text: "ok".into(),
            ts: 0,
            params: CtrlParams::default(),
        };
        assert!(ctrl.is_success());
        ctrl.code = 299;
        assert!(ctrl.is_success());
        ctrl.code = 300;
        assert!(!ctrl.is_success());
    }

    #[test]
    fn note_has_no_request_id() {
        let note = ClientMessage::Note(Note {
            topic: TopicName::new("grp1"),
            what: NoteWhat::Read,
            seq: Some(Seq::new(9)),
        });
        assert!(note.id().is_none());
        assert_eq!(note.topic().as_str(), "grp1");
    }

    #[test]
    fn earlier_data_query_is_bounded() {
        let q = MetaQuery::new().with_earlier_data(Some(Seq::new(40)), 20);
        let data = q.data.unwrap();
        assert_eq!(data.before, Some(Seq::new(40)));
        assert_eq!(data.limit, Some(20));
        assert_eq!(data.since, None);
    }
}
