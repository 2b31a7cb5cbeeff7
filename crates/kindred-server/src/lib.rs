//! `kindred-server` – HTTP and WebSocket access to the companion.
//!
//! Wraps an [`Orchestrator`][kindred_runtime::Orchestrator] in a small axum
//! application:
//!
//! 1. **JSON endpoints** for sending messages, reading history and affect,
//!    triggering ambient events, and session housekeeping.
//! 2. **A WebSocket stream** at `/ws` that forwards every [`EventBus`] event
//!    (recorded turns, affect changes, degradation alerts) to connected
//!    clients, and accepts messages in the other direction.
//!
//! [`EventBus`]: kindred_middleware::EventBus

pub mod error;
pub mod server;
pub mod ws;

pub use error::ServerError;
pub use server::{AppState, CompanionServer, DEFAULT_PORT, router};
