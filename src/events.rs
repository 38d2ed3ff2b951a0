//! Local event surface
//!
//! Fire-and-forget notifications consumed by the embedding UI layer. Events
//! are delivered at most once per occurrence over a broadcast channel; a UI
//! that is not currently subscribed simply misses them.

use crate::storage::{ChatMessage, Profile};
use tokio::sync::broadcast;

/// Channel depth before slow subscribers start lagging
const CHANNEL_CAPACITY: usize = 64;

/// Notifications emitted by the pairing and transport paths
#[derive(Debug, Clone)]
pub enum Event {
    /// A pairing completed and a new contact was persisted; carries no key
    /// material
    ContactAdded(Profile),
    /// An inbound message was decrypted and stored
    MessageReceived {
        /// Contact id the message belongs to
        peer_id: String,
        /// The decrypted message
        message: ChatMessage,
    },
    /// A locally sent message was acknowledged by the peer and stored
    MessageSent {
        /// Contact id the message was sent to
        peer_id: String,
        /// The sent message, plaintext echoed for immediate display
        message: ChatMessage,
    },
}

/// Broadcast handle shared by every component that emits events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with no subscribers
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Emit an event; silently dropped when nobody is listening
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
