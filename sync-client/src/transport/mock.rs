//! Mock transport for testing.
//!
//! Allows scripting server replies, queueing server pushes, injecting
//! failures and capturing sent frames for verification.

use super::{Transport, TransportError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tidings_sync_types::{ClientMessage, ServerMessage};

type Responder = Box<dyn FnMut(&ClientMessage) -> Vec<ServerMessage> + Send>;

/// Mock transport for testing.
///
/// A responder closure plays the server: every frame passed to `send()` is
/// decoded and handed to it, and the frames it returns are queued for
/// `recv()`.
#[derive(Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    connected: bool,
    connected_address: Option<String>,
    sent_messages: Vec<Vec<u8>>,
    receive_queue: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    fail_next_connect: Option<String>,
    fail_next_send: Option<String>,
    fail_next_recv: Option<String>,
    reconnect_requests: usize,
}

impl MockTransport {
    /// Create a new, disconnected mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock transport that is already connected.
    pub fn connected() -> Self {
        let transport = Self::new();
        transport.inner.lock().unwrap().connected = true;
        transport
    }

    /// Answer every sent frame with the frames returned by `responder`.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&ClientMessage) -> Vec<ServerMessage> + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.responder = Some(Box::new(responder));
    }

    /// Queue raw bytes to be returned by a later `recv()` call.
    pub fn queue_response(&self, data: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.receive_queue.push_back(data);
    }

    /// Queue a server frame to be returned by a later `recv()` call.
    pub fn push_server(&self, msg: &ServerMessage) {
        if let Ok(bytes) = msg.to_bytes() {
            self.queue_response(bytes);
        }
    }

    /// Get all frames that were sent.
    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.clone()
    }

    /// Get all sent frames that decode as client messages.
    pub fn sent_client_messages(&self) -> Vec<ClientMessage> {
        let inner = self.inner.lock().unwrap();
        inner
            .sent_messages
            .iter()
            .filter_map(|bytes| ClientMessage::from_bytes(bytes).ok())
            .collect()
    }

    /// Get the last frame that was sent.
    pub fn last_sent(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner.sent_messages.last().cloned()
    }

    /// Get the address that was connected to.
    pub fn connected_address(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.connected_address.clone()
    }

    /// Number of times a reconnect was requested.
    pub fn reconnect_requests(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.reconnect_requests
    }

    /// Drop the connection without a close handshake.
    pub fn drop_connection(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        inner.receive_queue.clear();
    }

    /// Cause the next connect() to fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_connect = Some(error.to_string());
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_send = Some(error.to_string());
    }

    /// Cause the next recv() to fail with the given error.
    pub fn fail_next_recv(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_recv = Some(error.to_string());
    }

    /// Clear all state (frames, queue, responder, connection).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = MockTransportInner::default();
    }
}

impl Clone for MockTransport {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_connect.take() {
            return Err(TransportError::ConnectionFailed(error));
        }

        inner.connected = true;
        inner.connected_address = Some(address.to_string());
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed(error));
        }

        inner.sent_messages.push(data.to_vec());

        if let (Some(responder), Ok(msg)) =
            (inner.responder.as_mut(), ClientMessage::from_bytes(data))
        {
            for reply in responder(&msg) {
                if let Ok(bytes) = reply.to_bytes() {
                    inner.receive_queue.push_back(bytes);
                }
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.connected {
            return Err(TransportError::NotConnected);
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_recv.take() {
            return Err(TransportError::ReceiveFailed(error));
        }

        inner
            .receive_queue
            .pop_front()
            .ok_or(TransportError::ConnectionClosed)
    }

    fn is_connected(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = false;
        Ok(())
    }

    async fn request_reconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.reconnect_requests += 1;
    }
}
