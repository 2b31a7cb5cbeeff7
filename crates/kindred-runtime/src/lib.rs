//! `kindred-runtime` – The companion's mind.
//!
//! Turns a stream of user messages into replies while keeping per-session
//! conversational and affective state consistent with the durable memory in
//! `kindred-memory`.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]: the
//!   per-message pipeline (validate, recall, extend, complete, persist, feel,
//!   notify) with per-session serialization and graceful degradation.
//! - [`session`] – [`SessionState`][session::SessionState] and the
//!   [`SessionRegistry`][session::SessionRegistry] that gives every session a
//!   single owner at a time.
//! - [`affect`] – [`AffectEngine`][affect::AffectEngine]: the deterministic
//!   mood/trust/energy state machine.
//! - [`sentiment`] – the [`SentimentScorer`][sentiment::SentimentScorer]
//!   capability and the offline [`LexiconSentiment`][sentiment::LexiconSentiment]
//!   scorer.
//! - [`llm_driver`] – the [`CompletionModel`][llm_driver::CompletionModel]
//!   capability and [`LlmDriver`][llm_driver::LlmDriver], an async client
//!   for any OpenAI-compatible server such as [Ollama](https://ollama.com).
//! - [`extensions`] – the turn-extension chain, `/plan` routing, and the
//!   ambient day/night event generator with its scheduler.
//! - [`persona`] – [`Persona`][persona::Persona]: name, traits and baseline
//!   affect that seed every session.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: console
//!   logging plus optional OTLP span export.

pub mod affect;
pub mod extensions;
pub mod llm_driver;
pub mod orchestrator;
pub mod persona;
pub mod sentiment;
pub mod session;
pub mod telemetry;

pub use affect::{AffectConfig, AffectEngine};
pub use extensions::{
    CompletionPlanner, EventCatalog, EventGenerator, ExtensionChain, ExtensionOutput, PlanRouter,
    Planner, SessionView, TurnExtension, spawn_event_scheduler,
};
pub use llm_driver::{CompletionModel, LlmDriver, LlmError};
pub use orchestrator::{FALLBACK_REPLY, Orchestrator, OrchestratorConfig, Reply};
pub use persona::{Persona, PersonaError};
pub use sentiment::{LexiconSentiment, SentimentScorer};
pub use session::{SessionPhase, SessionRegistry, SessionState};
pub use telemetry::{TracerProviderGuard, init_tracing};
