//! Domain event stream.
//!
//! The engine reports what it does to a state field as [`TransitionEvent`]s on
//! a broadcast channel. Observability consumers (audit logs, metrics, UIs)
//! subscribe through [`EventBus::subscribe`]; the engine itself only emits.

use crate::entity::StateKey;
use serde::Serialize;
use tokio::sync::broadcast;

/// Which step of a transition wrote a state value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    InProgress,
    Completed,
    Failed,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// The state lock was acquired.
    Locked,
    /// The transition was refused because the lock was held or lost.
    LockRejected,
    /// The state field was written.
    StateChanged {
        from: Option<String>,
        to: String,
        phase: Phase,
    },
    /// Side effects succeeded and the transition committed.
    Completed,
    /// A side effect failed.
    Failed { error: String },
    /// The state lock was released.
    Unlocked,
    /// A callback or failure callback failed and was swallowed.
    CallbackFailed {
        command: String,
        error: String,
        on_failure_path: bool,
    },
    /// The chained next transition did not resolve to exactly one match.
    ChainSkipped { next: String, matches: usize },
    /// Completing or failing a transition hit a store error after dispatch.
    ContinuationFailed { error: String },
}

/// One event on the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub key: StateKey,
    pub action: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Broadcasts transition events to any number of subscribers.
pub struct EventBus {
    sender: broadcast::Sender<TransitionEvent>,
}

impl EventBus {
    /// Creates a bus with the given channel capacity.
    pub fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self { sender }
    }

    /// Subscribes to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Emits an event. Never blocks; an event with no subscribers is dropped.
    pub fn emit(&self, key: &StateKey, action: &str, kind: EventKind) {
        tracing::debug!(
            kind = %key.kind,
            id = %key.id,
            field = %key.field,
            action,
            event = ?kind,
            "transition event"
        );

        // Ignore send errors (no receivers)
        let _ = self.sender.send(TransitionEvent {
            key: key.clone(),
            action: action.to_string(),
            kind,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
