//! Session context shared by every engine component.
//!
//! A [`Session`] owns the store handle, the transport, the local user and
//! the configuration. Components borrow it; nothing in the engine reaches
//! for process-wide state.
//!
//! # Request/response
//!
//! ```text
//! exchange(Pub{id:"7"}) ──send──▶ server
//!                       ◀─recv── Data, Info, ...   (queued)
//!                       ◀─recv── Ctrl{id:"7"}      (returned)
//! queued frames ──▶ handle()
//! ```
//!
//! The wire lock is held only while a request waits for its reply, so
//! frames pushed meanwhile are dispatched after it is released.
//!
//! A request that finds the connection gone detaches every attached topic,
//! so the next `attach` subscribes again and flushes the queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tidings_sync_core::{AttachAction, AttachEvent, AttachState, Pager, TopicEvent};
use tidings_sync_store::MessageStore;
use tidings_sync_types::{ClientMessage, Ctrl, Note, ServerMessage, TopicName, UserId};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::ClientEvent;
use crate::lifecycle::Lifecycle;
use crate::pager::PageLoader;
use crate::reconciler::Reconciler;
use crate::topic::TopicSync;
use crate::transport::{Transport, TransportError};

const EVENT_CAPACITY: usize = 256;

/// Explicit engine context: one per logged-in user.
pub struct Session<T: Transport> {
    store: Arc<dyn MessageStore>,
    transport: T,
    user: UserId,
    config: ClientConfig,
    next_id: AtomicU64,
    wire: Mutex<()>,
    events: broadcast::Sender<ClientEvent>,
    attach: DashMap<TopicName, AttachState>,
    pagers: DashMap<TopicName, Pager>,
}

impl<T: Transport> Session<T> {
    /// Create a session over a store and a transport.
    pub fn new(store: Arc<dyn MessageStore>, transport: T, config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            transport,
            user: UserId::new(config.session.user_id.clone()),
            config,
            next_id: AtomicU64::new(1),
            wire: Mutex::new(()),
            events,
            attach: DashMap::new(),
            pagers: DashMap::new(),
        }
    }

    /// The message store.
    pub fn store(&self) -> &dyn MessageStore {
        self.store.as_ref()
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The local user.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribe to engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Message lifecycle operations.
    pub fn lifecycle(&self) -> Lifecycle<'_, T> {
        Lifecycle::new(self)
    }

    /// Watermark reconciliation.
    pub fn reconciler(&self) -> Reconciler<'_, T> {
        Reconciler::new(self)
    }

    /// Paged history.
    pub fn pages(&self) -> PageLoader<'_, T> {
        PageLoader::new(self)
    }

    /// Topic attach orchestration.
    pub fn topics(&self) -> TopicSync<'_, T> {
        TopicSync::new(self)
    }

    /// Whether `topic` is currently attached.
    pub fn is_attached(&self, topic: &TopicName) -> bool {
        self.attach
            .get(topic)
            .map(|state| state.is_attached())
            .unwrap_or(false)
    }

    /// Attach state of `topic`.
    pub fn attach_state(&self, topic: &TopicName) -> AttachState {
        self.attach.get(topic).map(|state| *state).unwrap_or_default()
    }

    pub(crate) fn attached_topics(&self) -> Vec<TopicName> {
        self.attach
            .iter()
            .filter(|entry| !matches!(*entry.value(), AttachState::Detached))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Overwrite the attach state of `topic`.
    pub(crate) fn set_attach_state(&self, topic: &TopicName, state: AttachState) {
        debug!("Topic {} attach state forced to {:?}", topic, state);
        self.attach.insert(topic.clone(), state);
    }

    /// Feed an event to the attach state machine of `topic`.
    pub(crate) fn attach_event(&self, topic: &TopicName, event: AttachEvent) -> Vec<AttachAction> {
        let mut state = self.attach.entry(topic.clone()).or_default();
        let (next, actions) = state.on_event(event);
        if next != *state {
            debug!("Topic {} attach state {:?} -> {:?}", topic, *state, next);
        }
        *state = next;
        actions
    }

    /// Run `f` against the pager of `topic`, creating it on first use.
    pub(crate) fn with_pager<R>(&self, topic: &TopicName, f: impl FnOnce(&mut Pager) -> R) -> R {
        let mut pager = self
            .pagers
            .entry(topic.clone())
            .or_insert_with(|| Pager::new(self.config.paging.page_size));
        f(&mut pager)
    }

    pub(crate) fn emit(&self, event: ClientEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Allocate a request id.
    pub(crate) fn next_request_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Send a request and wait for its control response.
    ///
    /// Frames received before the response are handled once the wire is
    /// released. Codes of 300 and above become
    /// [`ClientError::ServerRejected`].
    pub async fn exchange(&self, msg: ClientMessage) -> Result<Ctrl, ClientError> {
        let result = self.request(msg).await;
        if matches!(result, Err(ClientError::NotConnected)) {
            self.connection_lost().await;
        }
        result
    }

    async fn request(&self, msg: ClientMessage) -> Result<Ctrl, ClientError> {
        if !self.transport.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let id = msg
            .id()
            .map(str::to_owned)
            .ok_or_else(|| ClientError::Protocol("request frame without id".into()))?;
        let bytes = msg.to_bytes()?;

        let mut pushed = Vec::new();
        let outcome = {
            let _wire = self.wire.lock().await;
            match self.transport.send(&bytes).await {
                Ok(()) => self.await_ctrl(&id, &mut pushed).await,
                Err(e) => Err(e.into()),
            }
        };

        for frame in pushed {
            self.dispatch(frame).await;
        }

        let ctrl = outcome?;
        if !ctrl.is_success() {
            return Err(ClientError::ServerRejected {
                code: ctrl.code,
                text: ctrl.text,
            });
        }
        Ok(ctrl)
    }

    /// Detach every attached topic after the connection went away.
    ///
    /// Topics still attaching are left to their own failure handling.
    pub(crate) async fn connection_lost(&self) {
        let attached: Vec<TopicName> = self
            .attach
            .iter()
            .filter(|entry| entry.value().is_attached())
            .map(|entry| entry.key().clone())
            .collect();

        for topic in attached {
            for action in self.attach_event(&topic, AttachEvent::ConnectionLost) {
                if let AttachAction::Emit(TopicEvent::Detached) = action {
                    if let Err(e) = self.store.topic_set_attached(&topic, false).await {
                        error!("Failed to record detach of {}: {}", topic, e);
                    }
                    info!("Detached from {}: connection lost", topic);
                    self.emit(ClientEvent::Detached {
                        topic: topic.clone(),
                    });
                }
            }
        }
    }

    async fn await_ctrl(
        &self,
        id: &str,
        pushed: &mut Vec<ServerMessage>,
    ) -> Result<Ctrl, ClientError> {
        let deadline = Instant::now() + self.config.request_timeout();
        loop {
            let bytes = match tokio::time::timeout_at(deadline, self.transport.recv()).await {
                Ok(received) => received?,
                Err(_) => return Err(TransportError::Timeout.into()),
            };
            match ServerMessage::from_bytes(&bytes) {
                Ok(ServerMessage::Ctrl(ctrl)) if ctrl.id.as_deref() == Some(id) => return Ok(ctrl),
                Ok(other) => pushed.push(other),
                Err(e) => warn!("Dropping undecodable frame ({} bytes): {}", bytes.len(), e),
            }
        }
    }

    /// Send a notification; the server does not answer.
    pub async fn notify(&self, note: Note) -> Result<(), ClientError> {
        if !self.transport.is_connected() {
            self.connection_lost().await;
            return Err(ClientError::NotConnected);
        }
        let bytes = ClientMessage::Note(note).to_bytes()?;
        let sent = {
            let _wire = self.wire.lock().await;
            self.transport.send(&bytes).await
        };
        match sent.map_err(ClientError::from) {
            Err(ClientError::NotConnected) => {
                self.connection_lost().await;
                Err(ClientError::NotConnected)
            }
            other => other,
        }
    }

    async fn dispatch(&self, frame: ServerMessage) {
        if let Err(e) = self.handle(frame).await {
            error!("Failed to handle server frame: {}", e);
        }
    }
}
