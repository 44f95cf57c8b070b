//! Transport abstraction for tidings.
//!
//! This module provides a pluggable transport layer that abstracts the
//! connection to the chat server. The engine only ever sees encoded frames.
//!
//! # Design
//!
//! The transport trait is async and connection-oriented:
//! - `connect()` establishes a connection
//! - `send()` transmits one encoded client frame
//! - `recv()` receives one encoded server frame
//! - `close()` gracefully terminates
//! - `request_reconnect()` asks the transport to reconnect now
//!
//! Reconnect loops and backoff belong to the transport. The engine only
//! requests a reconnect when an operation fails for lack of a connection.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.connect("chat.example.com:6060").await?;
//! transport.send(&frame_bytes).await?;
//! let response = transport.recv().await?;
//! ```

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// No response in time.
    #[error("request timed out")]
    Timeout,
}

/// Transport trait for exchanging frames with the chat server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the server at the given address.
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Send one encoded frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one encoded frame.
    ///
    /// Blocks until data is available or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the connection gracefully.
    async fn close(&self) -> Result<(), TransportError>;

    /// Ask the transport to reconnect as soon as it can.
    ///
    /// Returns immediately; the reconnect policy is the transport's own.
    async fn request_reconnect(&self);
}
