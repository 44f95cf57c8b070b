//! # sync-types
//!
//! Data model and wire shapes for the tidings message sync engine.
//!
//! This crate provides the foundational types used across all tidings crates:
//! - [`DbId`], [`Seq`], [`TopicName`], [`UserId`] - Identity and ordering types
//! - [`Message`], [`MessageState`], [`Content`] - Messages and their lifecycle
//! - [`Topic`], [`Subscription`], [`User`], [`SeqRange`] - Conversation records
//! - [`ClientMessage`], [`ServerMessage`] - Frames exchanged with the server
//! - [`SyncError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod message;
mod topic;
mod wire;

pub use error::SyncError;
pub use ids::{now_millis, DbId, Seq, Timestamp, TopicName, UserId};
pub use message::{Content, Message, MessageState};
pub use topic::{
    CachedRange, DeleteTarget, SeqRange, Subscription, Topic, User, WatermarkKind,
};
pub use wire::{
    ClientMessage, Ctrl, CtrlParams, DataEvent, DataQuery, Del, Get, InfoEvent, InfoWhat, Leave,
    MetaEvent, MetaQuery, Note, NoteWhat, PresEvent, PresWhat, Pub, ServerMessage, Sub, SubDesc,
    TopicDesc,
};
