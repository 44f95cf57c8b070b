//! # sync-client
//!
//! Message sync and lifecycle engine for tidings chat clients.
//!
//! This is the library a presentation layer talks to.
//!
//! ## Features
//!
//! - **Offline-first**: messages are persisted before they are sent and
//!   survive restarts, including ones that interrupt a transmission
//! - **Ordered flush**: queued messages go out in the order they were written
//! - **Watermarks**: recv/read receipts are monotonic and idempotent
//! - **Paged history**: served from the local cache, back-filled on demand
//! - **Transport Abstraction**: pluggable transport layer (mock included)
//! - **Pure State Machines**: uses sync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use tidings_sync_client::{ChatClient, ClientConfig};
//!
//! let client = ChatClient::start(store, transport, ClientConfig::default()).await?;
//! client.attach(&topic).await?;
//! client.send(&topic, Content::text("hello")).await?;
//! let page = client.load_older(&topic).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
mod inbound;
pub mod lifecycle;
pub mod pager;
pub mod reconciler;
pub mod session;
pub mod topic;
pub mod transport;
pub mod upload;

pub use client::ChatClient;
pub use config::{ClientConfig, ConfigError};
pub use error::ClientError;
pub use events::ClientEvent;
pub use lifecycle::Lifecycle;
pub use pager::PageLoader;
pub use reconciler::Reconciler;
pub use session::Session;
pub use topic::TopicSync;
pub use transport::{MockTransport, Transport, TransportError};
pub use upload::{Attachment, UploadError, Uploader};

// Re-exported so callers need only this crate.
pub use tidings_sync_core::{FlushReport, Refresh};
pub use tidings_sync_store::{MemoryStore, MessageStore, RecoveryReport, SqliteStore, StoreError};
