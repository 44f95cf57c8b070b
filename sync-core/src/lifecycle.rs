//! Message lifecycle transition table.
//!
//! This module decides, without side effects, whether a requested
//! transition is legal for a message and what the message looks like
//! afterwards. Stores call [`apply`] inside their per-row transaction, so a
//! rejected transition never reaches disk and an accepted one is written
//! atomically with the row it was checked against.
//!
//! ```text
//!            mark ready          begin sync           confirm
//!   Draft ───────────────▶ Ready ──────────▶ Syncing ─────────▶ Synced
//!     │                     ▲  │                │                 │
//!     │ discard             │  │ discard        │ sync failed     │ mark/apply delete
//!     ▼                     │  ▼                │                 ▼
//!  (removed)                └──(removed)◀───────┘        SoftDeleted ─▶ HardDeleted
//! ```

use std::fmt;
use tidings_sync_types::{Content, Message, MessageState, Seq, Timestamp};
use thiserror::Error;

/// A requested change to a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Replace the content of a draft.
    UpdateDraft {
        /// New content.
        content: Content,
    },
    /// Finalize content; the message becomes eligible for transmission.
    MarkReady {
        /// Replacement content, or `None` to keep the current content.
        content: Option<Content>,
    },
    /// Start the single allowed transmission.
    BeginSync,
    /// The in-flight transmission failed; revert for retry.
    SyncFailed,
    /// The server accepted the message.
    Confirm {
        /// Sequence assigned by the server.
        seq: Seq,
        /// Server timestamp.
        ts: Timestamp,
    },
    /// Drop a never-synced message.
    Discard,
    /// Record a delete locally before the server confirms it.
    MarkDeleted {
        /// Delete for everyone.
        hard: bool,
    },
    /// The server confirmed a delete.
    ApplyDelete {
        /// Delete for everyone.
        hard: bool,
    },
}

impl Transition {
    /// The kind of this transition, for error reporting.
    pub fn kind(&self) -> TransitionKind {
        match self {
            Self::UpdateDraft { .. } => TransitionKind::UpdateDraft,
            Self::MarkReady { .. } => TransitionKind::MarkReady,
            Self::BeginSync => TransitionKind::BeginSync,
            Self::SyncFailed => TransitionKind::SyncFailed,
            Self::Confirm { .. } => TransitionKind::Confirm,
            Self::Discard => TransitionKind::Discard,
            Self::MarkDeleted { .. } => TransitionKind::MarkDeleted,
            Self::ApplyDelete { .. } => TransitionKind::ApplyDelete,
        }
    }
}

/// Name of a [`Transition`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// See [`Transition::UpdateDraft`].
    UpdateDraft,
    /// See [`Transition::MarkReady`].
    MarkReady,
    /// See [`Transition::BeginSync`].
    BeginSync,
    /// See [`Transition::SyncFailed`].
    SyncFailed,
    /// See [`Transition::Confirm`].
    Confirm,
    /// See [`Transition::Discard`].
    Discard,
    /// See [`Transition::MarkDeleted`].
    MarkDeleted,
    /// See [`Transition::ApplyDelete`].
    ApplyDelete,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::UpdateDraft => "update draft",
            Self::MarkReady => "mark ready",
            Self::BeginSync => "begin sync",
            Self::SyncFailed => "fail sync",
            Self::Confirm => "confirm",
            Self::Discard => "discard",
            Self::MarkDeleted => "mark deleted",
            Self::ApplyDelete => "apply delete",
        };
        f.write_str(name)
    }
}

/// An illegal lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {transition} a message in state {from:?}")]
pub struct TransitionError {
    /// State the message was in.
    pub from: MessageState,
    /// Transition that was attempted.
    pub transition: TransitionKind,
}

/// What a store must do with the row after [`apply`] succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Write the mutated message back.
    Updated,
    /// Nothing changed; skip the write.
    Unchanged,
    /// Delete the row.
    Removed,
}

/// Compute the state reached by `transition` from `from`.
pub fn next_state(
    from: MessageState,
    transition: &Transition,
) -> Result<MessageState, TransitionError> {
    use MessageState::*;

    let next = match (from, transition) {
        (Draft, Transition::UpdateDraft { .. }) => Draft,
        (Draft | Ready, Transition::MarkReady { .. }) => Ready,
        (Ready, Transition::BeginSync) => Syncing,
        (Syncing, Transition::SyncFailed) => Ready,
        (Syncing, Transition::Confirm { .. }) => Synced,
        (Draft | Ready, Transition::Discard) => from,

        (Synced | SoftDeleted, Transition::MarkDeleted { hard: false }) => SoftDeleted,
        (Synced | SoftDeleted, Transition::MarkDeleted { hard: true }) => HardDeleted,
        (HardDeleted, Transition::MarkDeleted { .. }) => HardDeleted,

        (Synced | SoftDeleted, Transition::ApplyDelete { hard: false }) => SoftDeleted,
        (Synced | SoftDeleted, Transition::ApplyDelete { hard: true }) => HardDeleted,
        (HardDeleted, Transition::ApplyDelete { .. }) => HardDeleted,

        (from, t) => {
            return Err(TransitionError {
                from,
                transition: t.kind(),
            })
        }
    };
    Ok(next)
}

/// Apply `transition` to `msg` in place.
///
/// On error `msg` is left untouched.
pub fn apply(msg: &mut Message, transition: Transition) -> Result<Effect, TransitionError> {
    let next = next_state(msg.state, &transition)?;

    match transition {
        Transition::UpdateDraft { content } => msg.content = content,
        Transition::MarkReady { content } => {
            if let Some(content) = content {
                msg.content = content;
            }
        }
        Transition::BeginSync | Transition::SyncFailed => {}
        Transition::Confirm { seq, ts } => {
            msg.seq = Some(seq);
            msg.ts = ts;
        }
        Transition::Discard => return Ok(Effect::Removed),
        Transition::MarkDeleted { .. } => {
            if next == msg.state {
                return Ok(Effect::Unchanged);
            }
            msg.pending_delete = true;
        }
        Transition::ApplyDelete { hard } => {
            // A confirmed soft delete does not downgrade a pending hard one.
            if msg.state == MessageState::HardDeleted && !hard {
                return Ok(Effect::Unchanged);
            }
            let unchanged =
                next == msg.state && !msg.pending_delete && (!hard || msg.content.is_empty());
            if unchanged {
                return Ok(Effect::Unchanged);
            }
            msg.pending_delete = false;
            if hard {
                msg.content = Content::default();
            }
        }
    }

    msg.state = next;
    Ok(Effect::Updated)
}
