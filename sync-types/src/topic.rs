//! Topics, peer subscriptions, users and sequence ranges.

use serde::{Deserialize, Serialize};

use crate::{Content, Seq, Timestamp, TopicName, UserId};

/// A conversation as cached locally.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    /// Topic name.
    pub name: TopicName,
    /// Highest seq a peer reported as received.
    pub recv: Option<Seq>,
    /// Highest seq a peer reported as read.
    pub read: Option<Seq>,
    /// Highest seq reported by the server.
    pub max_seq: Option<Seq>,
    /// The full remote history has been fetched.
    pub all_loaded: bool,
    /// Currently subscribed.
    pub attached: bool,
    /// Peer presence.
    pub online: bool,
}

impl Topic {
    /// A topic known by name only.
    pub fn new(name: TopicName) -> Self {
        Self {
            name,
            recv: None,
            read: None,
            max_seq: None,
            all_loaded: false,
            attached: false,
            online: false,
        }
    }

    /// Watermark of the given kind.
    pub fn watermark(&self, kind: WatermarkKind) -> Option<Seq> {
        match kind {
            WatermarkKind::Recv => self.recv,
            WatermarkKind::Read => self.read,
        }
    }
}

/// A peer's membership record within a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    /// Topic the peer is subscribed to.
    pub topic: TopicName,
    /// The peer.
    pub user: UserId,
    /// Peer's received watermark as last reported by the server.
    pub recv: Option<Seq>,
    /// Peer's read watermark as last reported by the server.
    pub read: Option<Seq>,
    /// Access mode string.
    pub mode: String,
    /// Last update time reported by the server.
    pub updated: Timestamp,
}

/// Public metadata of a user, used to render senders and peers.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    /// User id.
    pub uid: UserId,
    /// Public profile document.
    pub public: Content,
    /// Last update time reported by the server.
    pub updated: Timestamp,
}

/// Which watermark an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatermarkKind {
    /// Delivered to the device.
    Recv,
    /// Seen by the user.
    Read,
}

/// Inclusive range of sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "SeqBounds")]
pub struct SeqRange {
    low: Seq,
    high: Seq,
}

/// Decoded bounds, in whatever order the peer sent them.
#[derive(Deserialize)]
struct SeqBounds {
    low: Seq,
    high: Seq,
}

impl From<SeqBounds> for SeqRange {
    fn from(bounds: SeqBounds) -> Self {
        Self::new(bounds.low, bounds.high)
    }
}

impl SeqRange {
    /// Range covering `a..=b`; the bounds are ordered if given reversed.
    pub fn new(a: Seq, b: Seq) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Range covering one sequence number.
    pub fn single(seq: Seq) -> Self {
        Self {
            low: seq,
            high: seq,
        }
    }

    /// Lowest sequence in the range.
    pub fn low(&self) -> Seq {
        self.low
    }

    /// Highest sequence in the range.
    pub fn high(&self) -> Seq {
        self.high
    }

    /// Check whether `seq` lies within the range.
    pub fn contains(&self, seq: Seq) -> bool {
        self.low <= seq && seq <= self.high
    }

    /// Number of sequence numbers covered.
    pub fn len(&self) -> u64 {
        self.high.value() - self.low.value() + 1
    }

    /// A range always covers at least one sequence.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// The span of sequence numbers materialized in the local store for a topic.
pub type CachedRange = SeqRange;

/// Messages addressed by a delete operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteTarget {
    /// Every sequence number in an inclusive range.
    Range(SeqRange),
    /// An explicit list of sequence numbers.
    List(Vec<Seq>),
}

impl DeleteTarget {
    /// Check whether the target addresses `seq`.
    pub fn contains(&self, seq: Seq) -> bool {
        match self {
            Self::Range(r) => r.contains(seq),
            Self::List(list) => list.contains(&seq),
        }
    }

    /// Lowest and highest sequence addressed, if any.
    pub fn bounds(&self) -> Option<SeqRange> {
        match self {
            Self::Range(r) => Some(*r),
            Self::List(list) => {
                let low = list.iter().min()?;
                let high = list.iter().max()?;
                Some(SeqRange::new(*low, *high))
            }
        }
    }

    /// Build the tightest target for a set of sequence numbers: a range when
    /// they are contiguous, a sorted list otherwise.
    pub fn from_seqs(mut seqs: Vec<Seq>) -> Option<Self> {
        seqs.sort();
        seqs.dedup();
        let (first, last) = (*seqs.first()?, *seqs.last()?);
        if last.value() - first.value() + 1 == seqs.len() as u64 {
            Some(Self::Range(SeqRange::new(first, last)))
        } else {
            Some(Self::List(seqs))
        }
    }
}
