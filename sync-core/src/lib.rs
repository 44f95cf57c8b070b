//! # sync-core
//!
//! Pure logic for tidings message sync (no I/O, instant tests).
//!
//! This crate implements the state machines and algorithms for keeping a
//! local message cache in step with the server, without any network or
//! disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects:
//! - [`lifecycle`] - which message state transitions are legal
//! - [`watermark`] - which cached messages a receipt report touches
//! - [`pager`] - whether older history comes from cache or server
//! - [`attach`] - what to do as a topic subscription progresses
//! - [`outbox`] - ordered, single-attempt transmission passes
//!
//! The actual I/O (network, disk) is performed by `sync-store` and
//! `sync-client`, which interpret the decisions made here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attach;
pub mod lifecycle;
pub mod outbox;
pub mod pager;
pub mod watermark;

pub use attach::{AttachAction, AttachEvent, AttachState, FailureKind, TopicEvent};
pub use lifecycle::{apply, next_state, Effect, Transition, TransitionError, TransitionKind};
pub use outbox::{FlushReport, Outbox};
pub use pager::{PagePlan, Pager, DEFAULT_PAGE_SIZE};
pub use watermark::{Refresh, WatermarkTracker};
