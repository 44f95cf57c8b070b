//! Read/received watermark tracking.
//!
//! Peers report how far they have received or read a topic with `info`
//! notifications. Each report is checked against the last known watermark
//! for that kind to decide which cached messages need their receipt badges
//! refreshed:
//! - No prior watermark: refresh everything
//! - Watermark advanced: refresh only `(old, new]`
//! - Watermark unchanged or moved backwards: nothing to do
//!
//! Watermarks only move forward. Replaying the same notification is a no-op.

use tidings_sync_types::{Seq, SeqRange, WatermarkKind};

/// Which cached messages need a redraw after a watermark report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Nothing changed.
    None,
    /// No prior watermark was known; reload every cached message.
    All,
    /// Reload messages whose seq falls in this range.
    Range(SeqRange),
}

/// Tracks the recv and read watermarks of one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatermarkTracker {
    recv: Option<Seq>,
    read: Option<Seq>,
}

impl WatermarkTracker {
    /// Create a tracker with no known watermarks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker resuming from persisted watermarks.
    pub fn with_watermarks(recv: Option<Seq>, read: Option<Seq>) -> Self {
        Self { recv, read }
    }

    /// Current watermark of the given kind.
    pub fn get(&self, kind: WatermarkKind) -> Option<Seq> {
        match kind {
            WatermarkKind::Recv => self.recv,
            WatermarkKind::Read => self.read,
        }
    }

    /// Record a reported watermark and return what needs refreshing.
    ///
    /// A report without a seq carries no position and is ignored.
    pub fn observe(&mut self, kind: WatermarkKind, seq: Option<Seq>) -> Refresh {
        let Some(seq) = seq else {
            return Refresh::None;
        };

        let slot = match kind {
            WatermarkKind::Recv => &mut self.recv,
            WatermarkKind::Read => &mut self.read,
        };

        match *slot {
            None => {
                *slot = Some(seq);
                Refresh::All
            }
            Some(old) if seq > old => {
                *slot = Some(seq);
                Refresh::Range(SeqRange::new(old.next(), seq))
            }
            Some(_) => Refresh::None,
        }
    }
}
