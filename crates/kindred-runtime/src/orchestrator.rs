//! [`Orchestrator`] – the Session Orchestrator.
//!
//! Drives one exchange per call to [`Orchestrator::handle_message`]:
//!
//! 1. **Validate** – reject bad input before anything is touched, then load or
//!    create the session and take its lock.
//! 2. **Recall** – ask the [`MemoryCoordinator`] for the top-K related turns
//!    of this session (best effort).
//! 3. **Extend** – give the [`ExtensionChain`] first refusal (e.g. `/plan`).
//! 4. **Complete** – persona, affect summary, recalled turns and the recent
//!    history window go to the [`CompletionModel`] under a timeout. Any
//!    failure yields [`FALLBACK_REPLY`].
//! 5. **Persist** – store the user turn, then the assistant turn. This is the
//!    only step whose failure is returned to the caller.
//! 6. **Feel** – update affect from the exchange and snapshot it.
//! 7. **Notify** – publish turn and affect events on the [`EventBus`].
//!
//! Steps 1–7 run while holding the session's async mutex, so calls for the
//! same session are applied one at a time in arrival order while different
//! sessions proceed in parallel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime, Timelike};
use kindred_memory::affect_log::AffectLog;
use kindred_memory::{CoordinatorStats, MemoryCoordinator, RetrievalResult};
use kindred_middleware::EventBus;
use kindred_types::{
    AffectSnapshot, AffectVector, CapabilityError, CompanionError, Event, EventPayload, RecordId,
    Role, SessionId, Turn, validate_message,
};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, instrument, warn};

use crate::affect::{AffectConfig, AffectEngine};
use crate::extensions::{EventCatalog, EventGenerator, ExtensionChain, Planner, SessionView};
use crate::llm_driver::CompletionModel;
use crate::persona::Persona;
use crate::session::{SessionHandle, SessionPhase, SessionRegistry, SessionState};

const SOURCE: &str = "kindred-runtime::orchestrator";

/// Reply used whenever the completion capability is missing or fails.
pub const FALLBACK_REPLY: &str =
    "I'm having trouble finding the words right now, but I'm still here. Could you tell me a bit more?";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Prior turns passed to the completion model.
    pub history_window: usize,
    /// Turns recalled from the semantic index per message.
    pub retrieval_k: usize,
    pub completion_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            retrieval_k: 3,
            completion_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of one exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub reply: String,
    pub affect: AffectVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<String>>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

pub struct Orchestrator {
    memory: Arc<MemoryCoordinator>,
    engine: AffectEngine,
    completion: Option<Arc<dyn CompletionModel>>,
    extensions: ExtensionChain,
    planner: Option<Arc<dyn Planner>>,
    events: EventGenerator,
    persona: Persona,
    affect_log: Option<Arc<AffectLog>>,
    bus: Option<EventBus>,
    sessions: SessionRegistry,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(memory: Arc<MemoryCoordinator>, config: OrchestratorConfig) -> Self {
        Self {
            memory,
            engine: AffectEngine::new(AffectConfig::default()),
            completion: None,
            extensions: ExtensionChain::new(),
            planner: None,
            events: EventGenerator::default(),
            persona: Persona::default(),
            affect_log: None,
            bus: None,
            sessions: SessionRegistry::new(),
            config,
        }
    }

    pub fn with_completion(mut self, model: Option<Arc<dyn CompletionModel>>) -> Self {
        self.completion = model;
        self
    }

    /// Replace the affect engine; its baseline is reset to the persona's.
    pub fn with_affect_engine(mut self, engine: AffectEngine) -> Self {
        self.engine = engine.with_baseline(self.persona.baseline());
        self
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.engine = self.engine.with_baseline(persona.baseline());
        self.persona = persona;
        self
    }

    pub fn with_extensions(mut self, extensions: ExtensionChain) -> Self {
        self.extensions = extensions;
        self
    }

    /// Planner behind [`Orchestrator::plan`].
    pub fn with_planner(mut self, planner: Option<Arc<dyn Planner>>) -> Self {
        self.planner = planner;
        self
    }

    pub fn with_event_catalog(mut self, catalog: EventCatalog) -> Self {
        self.events = EventGenerator::new(catalog);
        self
    }

    /// Persist every affect snapshot and restore sessions from it.
    pub fn with_affect_log(mut self, log: Option<Arc<AffectLog>>) -> Self {
        self.affect_log = log;
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn memory_stats(&self) -> CoordinatorStats {
        self.memory.stats()
    }

    // ── Sessions ─────────────────────────────────────────────────────────────

    /// The handle for `session_id`, creating the session on first use.
    ///
    /// A new session resumes its durable history and, when an affect log is
    /// configured, its last recorded affect; otherwise it starts at the
    /// persona baseline.
    fn open(&self, session_id: &SessionId) -> Result<SessionHandle, CompanionError> {
        if let Some(handle) = self.sessions.get(session_id) {
            return Ok(handle);
        }
        let history = self.memory.history(session_id)?;
        let affect = self.restored_affect(session_id);
        info!(session_id = %session_id, resumed_turns = history.len(), "session opened");
        let state = SessionState::new(session_id.clone(), affect).with_history(history);
        Ok(self.sessions.insert_if_absent(state))
    }

    fn restored_affect(&self, session_id: &SessionId) -> AffectVector {
        let baseline = self.persona.baseline();
        let Some(log) = &self.affect_log else {
            return baseline;
        };
        match log.latest(session_id) {
            Ok(Some(snapshot)) => snapshot.affect,
            Ok(None) => baseline,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "affect restore failed; using baseline");
                baseline
            }
        }
    }

    /// Ids of sessions currently held in memory.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.sessions.ids()
    }

    /// Ids of every session with at least one durable turn.
    pub fn logged_sessions(&self) -> Result<Vec<SessionId>, CompanionError> {
        self.memory.logged_sessions()
    }

    /// Lock the live state of `session_id`, opening it if needed.
    ///
    /// A handle that was closed while we queued on it is retired, so retry
    /// against the reopened session.
    async fn lock_session(
        &self,
        session_id: &SessionId,
    ) -> Result<OwnedMutexGuard<SessionState>, CompanionError> {
        loop {
            let state = self.open(session_id)?.lock_owned().await;
            if !state.is_closed() {
                return Ok(state);
            }
            debug!(session_id = %session_id, "session closed while waiting; reopening");
        }
    }

    /// Drop the in-memory state of `session_id`. Durable turns are kept.
    ///
    /// Waits for a running exchange or event on the session to finish.
    pub async fn close_session(&self, session_id: &SessionId) -> bool {
        let Some(handle) = self.sessions.get(session_id) else {
            return false;
        };
        let mut state = handle.lock().await;
        if state.is_closed() {
            return false;
        }
        // Still registered: only a close removes a live handle.
        self.sessions.remove(session_id);
        state.mark_closed();
        drop(state);
        info!(session_id = %session_id, "session closed");
        self.publish(EventPayload::SessionClosed(session_id.clone()));
        true
    }

    /// Close every open session.
    pub async fn shutdown(&self) {
        for session_id in self.sessions.ids() {
            self.close_session(&session_id).await;
        }
    }

    // ── Exchange ─────────────────────────────────────────────────────────────

    /// Run one user/assistant exchange for `session_id`.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Validation`] for empty, oversized or malformed input
    /// (nothing is recorded), or [`CompanionError::Persistence`] when a turn
    /// cannot be written to the log. Every other failure degrades silently.
    #[instrument(skip(self, text), fields(session_id = %session_id))]
    pub async fn handle_message(&self, session_id: &SessionId, text: &str) -> Result<Reply, CompanionError> {
        let text = validate_message(text)?;
        let mut state = self.lock_session(session_id).await?;

        state.phase = SessionPhase::Processing;
        let result = self.exchange(&mut state, &text).await;
        if let Err(e) = &result {
            state.phase = SessionPhase::Failed;
            error!(session_id = %session_id, error = %e, "exchange failed");
        }
        state.phase = SessionPhase::Idle;
        result
    }

    async fn exchange(&self, state: &mut SessionState, text: &str) -> Result<Reply, CompanionError> {
        let session_id = state.session_id.clone();

        // ── 2. Recall ──
        let recalled = self
            .memory
            .retrieve(&session_id, text, self.config.retrieval_k)
            .await;

        // ── 3. Extend ──
        let view = SessionView {
            session_id: &session_id,
            affect: state.affect,
            history: &state.history,
        };
        let extended = self.extensions.run(&view, text).await;

        // ── 4. Complete ──
        let (reply, plan) = match extended {
            Some(out) => (out.reply, out.plan),
            None => {
                let window = state.window(self.config.history_window);
                let context = self.system_context(state.affect, &recalled, window);
                (self.complete(&session_id, &context, window, text).await, None)
            }
        };

        // ── 5. Persist ──
        let user = Turn::at(session_id.clone(), Role::User, text, state.next_timestamp());
        self.record(state, user).await?;
        let assistant = Turn::at(session_id.clone(), Role::Assistant, reply.as_str(), state.next_timestamp());
        self.record(state, assistant).await?;

        // ── 6. Feel ──
        let affect = self.engine.update(state.affect, text, &reply);
        self.remember_affect(state, affect);

        Ok(Reply { reply, affect, plan })
    }

    /// Store `turn`, append it to the in-memory history and announce it.
    async fn record(&self, state: &mut SessionState, turn: Turn) -> Result<RecordId, CompanionError> {
        let record_id = self.memory.store(&turn).await?;
        state.history.push(turn.clone());
        self.publish(EventPayload::TurnRecorded { record_id, turn });
        Ok(record_id)
    }

    fn remember_affect(&self, state: &mut SessionState, affect: AffectVector) -> AffectSnapshot {
        let snapshot = state.record_affect(affect);
        if let Some(log) = &self.affect_log {
            if let Err(e) = log.record(&state.session_id, &snapshot) {
                warn!(session_id = %state.session_id, error = %e, "affect snapshot not persisted");
                self.degraded("affect_log", e.to_string());
            }
        }
        self.publish(EventPayload::AffectUpdated {
            session_id: state.session_id.clone(),
            affect: snapshot.affect,
        });
        snapshot
    }

    async fn complete(&self, session_id: &SessionId, context: &str, window: &[Turn], text: &str) -> String {
        let Some(model) = &self.completion else {
            debug!(session_id = %session_id, "no completion model; using fallback reply");
            return FALLBACK_REPLY.to_string();
        };
        let timeout = self.config.completion_timeout;
        match tokio::time::timeout(timeout, model.complete(context, window, text)).await {
            Ok(Ok(reply)) if !reply.trim().is_empty() => reply,
            Ok(Ok(_)) => {
                warn!(session_id = %session_id, "completion was empty; using fallback reply");
                FALLBACK_REPLY.to_string()
            }
            Ok(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "completion failed; using fallback reply");
                self.degraded("completion", e.to_string());
                FALLBACK_REPLY.to_string()
            }
            Err(_) => {
                warn!(session_id = %session_id, timeout_ms = timeout.as_millis() as u64, "completion timed out; using fallback reply");
                self.degraded("completion", format!("timed out after {timeout:?}"));
                FALLBACK_REPLY.to_string()
            }
        }
    }

    /// Persona, current affect, and recalled turns not already in `window`.
    fn system_context(&self, affect: AffectVector, recalled: &RetrievalResult, window: &[Turn]) -> String {
        let mut context = self.persona.system_prompt();
        context.push_str("\n\n");
        context.push_str(&describe_affect(affect));

        let memories: Vec<&Turn> = recalled
            .iter()
            .map(|(turn, _)| turn)
            .filter(|turn| !window.contains(turn))
            .collect();
        if !memories.is_empty() {
            context.push_str("\n\nThings you remember from earlier in this conversation:");
            for turn in memories {
                context.push_str(&format!("\n- ({}) {}", turn.role, turn.text));
            }
        }
        context
    }

    // ── Planning ─────────────────────────────────────────────────────────────

    /// Break `task` into steps without touching any session.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Validation`] for an empty or oversized task, and
    /// [`CompanionError::Capability`] when no planner is configured or it
    /// fails or times out.
    pub async fn plan(&self, task: &str) -> Result<Vec<String>, CompanionError> {
        let task = validate_message(task)?;
        let Some(planner) = &self.planner else {
            return Err(CapabilityError::Unavailable("no planner configured".into()).into());
        };
        let timeout = self.config.completion_timeout;
        let result = tokio::time::timeout(timeout, planner.plan(&task))
            .await
            .map_err(|_| CapabilityError::Timeout(timeout))
            .and_then(|r| r);
        match result {
            Ok(steps) => {
                debug!(steps = steps.len(), "plan ready");
                Ok(steps)
            }
            Err(e) => {
                warn!(error = %e, "planning failed");
                self.degraded("planner", e.to_string());
                Err(e.into())
            }
        }
    }

    // ── Ambient events ───────────────────────────────────────────────────────

    /// Keys of the event catalog, in sorted order.
    pub fn event_keys(&self) -> Vec<String> {
        self.events.catalog().keys().map(str::to_string).collect()
    }

    /// Deliver an ambient event chosen for the time of day of `at`.
    ///
    /// Returns `Ok(None)` when the catalog has nothing for that time.
    pub async fn trigger_event(
        &self,
        session_id: &SessionId,
        at: NaiveDateTime,
    ) -> Result<Option<Turn>, CompanionError> {
        self.trigger_keyed_event(session_id, EventCatalog::key_for_hour(at.hour()))
            .await
    }

    /// [`Orchestrator::trigger_event`] at the current local time.
    pub async fn trigger_event_now(&self, session_id: &SessionId) -> Result<Option<Turn>, CompanionError> {
        self.trigger_event(session_id, Local::now().naive_local()).await
    }

    /// Deliver an ambient event from the catalog entry `key`.
    ///
    /// The event turn is stored, appended to history and applied to affect;
    /// it never reaches the completion model as a prompt of its own.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn trigger_keyed_event(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Result<Option<Turn>, CompanionError> {
        let mut state = self.lock_session(session_id).await?;

        let Some(template) = self.events.pick(session_id, state.event_count, key) else {
            debug!(key, "no event template for context");
            return Ok(None);
        };
        let turn = Turn::at(session_id.clone(), Role::Event, template, state.next_timestamp());
        self.record(&mut state, turn.clone()).await?;
        state.event_count += 1;

        let affect = self.engine.apply_event(state.affect, &turn.text);
        self.remember_affect(&mut state, affect);
        info!(key, event = %turn.text, "ambient event delivered");
        Ok(Some(turn))
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    /// The durable history of `session_id`, oldest first.
    pub fn history(&self, session_id: &SessionId) -> Result<Vec<Turn>, CompanionError> {
        self.memory.history(session_id)
    }

    /// Current affect of `session_id`. Sessions that are not open report the
    /// affect they would resume with.
    pub async fn affect(&self, session_id: &SessionId) -> AffectVector {
        match self.sessions.get(session_id) {
            Some(handle) => handle.lock().await.affect,
            None => self.restored_affect(session_id),
        }
    }

    /// Affect snapshots of `session_id`, oldest first.
    pub async fn affect_history(&self, session_id: &SessionId) -> Vec<AffectSnapshot> {
        if let Some(handle) = self.sessions.get(session_id) {
            return handle.lock().await.affect_history.clone();
        }
        let Some(log) = &self.affect_log else {
            return Vec::new();
        };
        log.history(session_id, crate::session::MAX_AFFECT_HISTORY)
            .unwrap_or_else(|e| {
                warn!(session_id = %session_id, error = %e, "affect history unavailable");
                Vec::new()
            })
    }

    /// Index log records of `session_id` that the semantic index is missing.
    pub async fn reindex(&self, session_id: &SessionId) -> Result<usize, CompanionError> {
        let repaired = self.memory.reindex(session_id).await?;
        if repaired > 0 {
            info!(session_id = %session_id, repaired, "semantic index repaired");
        }
        Ok(repaired)
    }

    // ── Bus ──────────────────────────────────────────────────────────────────

    fn publish(&self, payload: EventPayload) {
        if let Some(bus) = &self.bus {
            // Nobody listening is a normal condition.
            let _ = bus.publish(Event::new(SOURCE, payload));
        }
    }

    fn degraded(&self, component: &str, message: String) {
        self.publish(EventPayload::Degraded {
            component: component.to_string(),
            message,
        });
    }
}

/// One-line natural-language summary of `affect` for the system prompt.
pub(crate) fn describe_affect(affect: AffectVector) -> String {
    let mood = match affect.mood {
        m if m < 0.2 => "very low",
        m if m < 0.4 => "low",
        m if m < 0.6 => "even",
        m if m < 0.8 => "good",
        _ => "excellent",
    };
    let trust = match affect.trust {
        t if t < 0.35 => "guarded",
        t if t < 0.65 => "open",
        _ => "deeply trusting",
    };
    let energy = match affect.energy {
        e if e < 0.35 => "tired",
        e if e < 0.65 => "steady",
        _ => "energetic",
    };
    format!(
        "Your current mood is {mood} ({:.2}), you feel {trust} toward the user ({:.2}), and you are {energy} ({:.2}). Let this colour your tone.",
        affect.mood, affect.trust, affect.energy
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
