//! Messages and their lifecycle states.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{DbId, Seq, SyncError, Timestamp, TopicName, UserId};

/// Opaque message payload.
///
/// A rich-text/attachment document. The engine never interprets it beyond
/// storing and transmitting it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Content(Value);

impl Content {
    /// Wrap an arbitrary JSON document.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Plain-text document.
    pub fn text(text: &str) -> Self {
        Self(json!({ "txt": text }))
    }

    /// Document carrying a single file attachment.
    ///
    /// `url` is `None` while the upload is still in progress.
    pub fn attachment(mime: &str, name: &str, url: Option<&str>, size: u64) -> Self {
        Self(json!({
            "txt": " ",
            "fmt": [{ "at": -1, "len": 0, "key": 0 }],
            "ent": [{
                "tp": "EX",
                "data": { "mime": mime, "name": name, "ref": url, "size": size }
            }]
        }))
    }

    /// The plain text of the document, if it has any.
    pub fn as_text(&self) -> Option<&str> {
        self.0.get("txt").and_then(Value::as_str)
    }

    /// Borrow the underlying document.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// True for an empty (tombstoned) document.
    pub fn is_empty(&self) -> bool {
        self.0.is_null()
    }

    /// Serialize to a JSON string for storage.
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(&self.0).map_err(SyncError::Content)
    }

    /// Parse from a stored JSON string.
    pub fn from_json(s: &str) -> Result<Self, SyncError> {
        serde_json::from_str(s).map(Self).map_err(SyncError::Content)
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Authored locally, content not final, never transmitted.
    Draft,
    /// Final content, queued for transmission.
    Ready,
    /// One transmission in flight.
    Syncing,
    /// Confirmed by the server, has a sequence number.
    Synced,
    /// Hidden from history, record retained.
    SoftDeleted,
    /// Removed from active history, kept as a tombstone.
    HardDeleted,
}

impl MessageState {
    /// Numeric code used by persistent stores.
    pub fn code(&self) -> i64 {
        match self {
            Self::Draft => 10,
            Self::Ready => 20,
            Self::Syncing => 30,
            Self::Synced => 40,
            Self::SoftDeleted => 50,
            Self::HardDeleted => 60,
        }
    }

    /// Inverse of [`MessageState::code`].
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            10 => Some(Self::Draft),
            20 => Some(Self::Ready),
            30 => Some(Self::Syncing),
            40 => Some(Self::Synced),
            50 => Some(Self::SoftDeleted),
            60 => Some(Self::HardDeleted),
            _ => None,
        }
    }

    /// States that carry a server sequence number.
    pub fn has_seq(&self) -> bool {
        matches!(self, Self::Synced | Self::SoftDeleted | Self::HardDeleted)
    }

    /// Not yet confirmed by the server.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Draft | Self::Ready | Self::Syncing)
    }

    /// Soft or hard deleted.
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::SoftDeleted | Self::HardDeleted)
    }
}

/// A message as persisted in the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Local row id.
    pub id: DbId,
    /// Owning topic.
    pub topic: TopicName,
    /// Server sequence, set iff the state carries one.
    pub seq: Option<Seq>,
    /// Author.
    pub from: UserId,
    /// Payload.
    pub content: Content,
    /// Local creation time, or server time once delivered.
    pub ts: Timestamp,
    /// Lifecycle state.
    pub state: MessageState,
    /// A delete was recorded locally and awaits server confirmation.
    pub pending_delete: bool,
}

impl Message {
    /// Check the sequence/state invariant for this row.
    pub fn is_consistent(&self) -> bool {
        self.seq.is_some() == self.state.has_seq()
    }
}
