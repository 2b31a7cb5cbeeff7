//! `kindred-middleware` – in-process notifications.
//!
//! Routes companion events (recorded turns, affect changes, degradation
//! alerts) from the orchestrator to any number of observers, such as the
//! WebSocket stream in `kindred-server`, without the publisher knowing who is
//! listening.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe event bus built on Tokio
//!   broadcast channels.

pub mod bus;

pub use bus::{BusError, EventBus, Topic, TopicReceiver};
