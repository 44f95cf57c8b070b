//! Topic attach state machine.
//!
//! A topic is attached once the server has accepted our subscription. This
//! module decides, without I/O, what to do as the subscription progresses.
//! It takes events as input and produces a new state plus a list of actions
//! for sync-client to execute.
//!
//! On a successful subscribe the queued outbox is flushed before the visible
//! window is loaded, so locally composed messages reach the server first.

/// Attach state of one topic - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachState {
    /// Not subscribed.
    #[default]
    Detached,
    /// Subscribe request in flight.
    Attaching,
    /// Subscription accepted by the server.
    Attached,
}

impl AttachState {
    /// Create a new state machine in the Detached state.
    pub fn new() -> Self {
        Self::Detached
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: AttachEvent) -> (Self, Vec<AttachAction>) {
        match (self, event) {
            (Self::Detached, AttachEvent::AttachRequested) => {
                (Self::Attaching, vec![AttachAction::Subscribe])
            }

            (Self::Attaching, AttachEvent::SubscribeSucceeded) => (
                Self::Attached,
                vec![
                    AttachAction::Emit(TopicEvent::Attached),
                    AttachAction::FlushQueued,
                    AttachAction::LoadVisible,
                ],
            ),
            (Self::Attaching, AttachEvent::SubscribeFailed { kind, error }) => {
                let mut actions = Vec::with_capacity(2);
                if kind == FailureKind::NotConnected {
                    actions.push(AttachAction::RequestReconnect);
                }
                actions.push(AttachAction::Emit(TopicEvent::AttachFailed { error }));
                (Self::Detached, actions)
            }

            (Self::Attached, AttachEvent::LeaveRequested) => (
                Self::Detached,
                vec![AttachAction::Leave, AttachAction::Emit(TopicEvent::Detached)],
            ),

            (Self::Attaching | Self::Attached, AttachEvent::ConnectionLost) => {
                (Self::Detached, vec![AttachAction::Emit(TopicEvent::Detached)])
            }

            // Repeated requests and stale replies - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if the subscription is active.
    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached)
    }

    /// Check if a subscribe request is in flight.
    pub fn is_attaching(&self) -> bool {
        matches!(self, Self::Attaching)
    }
}

/// Events in a topic's attach lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachEvent {
    /// Caller asked to attach.
    AttachRequested,
    /// Server accepted the subscribe.
    SubscribeSucceeded,
    /// Subscribe failed.
    SubscribeFailed {
        /// Class of failure.
        kind: FailureKind,
        /// Error message describing the failure.
        error: String,
    },
    /// Caller asked to detach.
    LeaveRequested,
    /// The session dropped.
    ConnectionLost,
}

/// Broad class of a subscribe failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No live session; a reconnect may help.
    NotConnected,
    /// Anything else (server rejection, protocol error).
    Other,
}

/// Actions to be executed by sync-client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachAction {
    /// Send the subscribe request.
    Subscribe,
    /// Transmit every queued message and pending delete, oldest first.
    FlushQueued,
    /// Load the visible page window from the store.
    LoadVisible,
    /// Ask the transport to reconnect immediately.
    RequestReconnect,
    /// Send a leave request.
    Leave,
    /// Emit an event to the application.
    Emit(TopicEvent),
}

/// Attach events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicEvent {
    /// The topic is attached.
    Attached,
    /// Attaching failed.
    AttachFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// The topic is no longer attached.
    Detached,
}
