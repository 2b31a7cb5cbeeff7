//! Typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others. Publishing never waits: a slow subscriber lags and is told how
//! many events it missed.
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Conversation`] | `TurnRecorded` for every durable user, assistant and event turn |
//! | [`Topic::Affect`] | `AffectUpdated` after each exchange or ambient event |
//! | [`Topic::SystemAlerts`] | `Degraded` best-effort failures, `SessionClosed` |
//!
//! Every event is also mirrored on a global channel ([`EventBus::subscribe`])
//! for observers that want the whole stream.

use kindred_types::{Event, EventPayload};
use thiserror::Error;
use tokio::sync::broadcast;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("no subscribers on {0:?}")]
    NoSubscribers(Topic),
}

/// Routing lanes of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation,
    Affect,
    SystemAlerts,
}

impl Topic {
    /// The lane an event belongs on, derived from its payload.
    pub fn of(event: &Event) -> Topic {
        match event.payload {
            EventPayload::TurnRecorded { .. } => Topic::Conversation,
            EventPayload::AffectUpdated { .. } => Topic::Affect,
            EventPayload::Degraded { .. } | EventPayload::SessionClosed(_) => Topic::SystemAlerts,
        }
    }
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<Event>,
    conversation: broadcast::Sender<Event>,
    affect: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus; `capacity` applies to every channel independently.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (all, _) = broadcast::channel(capacity);
        let (conversation, _) = broadcast::channel(capacity);
        let (affect, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            all,
            conversation,
            affect,
            system_alerts,
        }
    }

    /// Publish `event` on the lane chosen by [`Topic::of`] and on the global
    /// channel.
    ///
    /// Returns the total number of receivers handed the event, or
    /// [`BusError::NoSubscribers`] when nobody is listening anywhere. Callers
    /// on the hot path treat that as a normal condition and discard it.
    pub fn publish(&self, event: Event) -> Result<usize, BusError> {
        let topic = Topic::of(&event);
        let lane = self.topic_sender(topic).send(event.clone()).unwrap_or(0);
        let global = self.all.send(event).unwrap_or(0);
        match lane + global {
            0 => Err(BusError::NoSubscribers(topic)),
            n => Ok(n),
        }
    }

    /// Subscribe to one lane.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Subscribe to every event regardless of topic.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Conversation => &self.conversation,
            Topic::Affect => &self.affect,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receivers
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`] channel.
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// `Err(Lagged(n))` means `n` events were dropped for this subscriber;
    /// `Err(Closed)` means the bus is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}
