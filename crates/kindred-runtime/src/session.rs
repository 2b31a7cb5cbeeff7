//! Per-session conversational state and its registry.
//!
//! Each [`SessionId`] maps to exactly one `Arc<tokio::sync::Mutex<SessionState>>`.
//! Holding that async mutex is what makes a caller the session's single
//! owner for the duration of an exchange. The registry map itself sits
//! behind a `std::sync::Mutex` that is only held for lookups and inserts,
//! never across an `.await`.
//!
//! Closing a session marks its state closed while holding the async mutex.
//! Anyone still queued on that handle sees the mark and reopens, so a
//! session never has two live states.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use kindred_types::{AffectSnapshot, AffectVector, SessionId, Turn};
use serde::Serialize;

/// Snapshots kept in memory per session; older ones are dropped first.
pub const MAX_AFFECT_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Processing,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: SessionId,
    pub history: Vec<Turn>,
    pub affect: AffectVector,
    pub affect_history: Vec<AffectSnapshot>,
    pub phase: SessionPhase,
    pub created_at: DateTime<Utc>,
    /// Ambient events delivered so far; drives event selection.
    pub event_count: u64,
    last_timestamp: Option<DateTime<Utc>>,
    closed: bool,
}

impl SessionState {
    pub fn new(session_id: SessionId, affect: AffectVector) -> Self {
        Self {
            session_id,
            history: Vec::new(),
            affect: affect.sanitized(),
            affect_history: Vec::new(),
            phase: SessionPhase::Idle,
            created_at: Utc::now(),
            event_count: 0,
            last_timestamp: None,
            closed: false,
        }
    }

    /// Resume from turns already in the durable log.
    pub fn with_history(mut self, history: Vec<Turn>) -> Self {
        self.last_timestamp = history.iter().map(|t| t.timestamp).max();
        self.event_count = history
            .iter()
            .filter(|t| t.role == kindred_types::Role::Event)
            .count() as u64;
        self.history = history;
        self
    }

    /// A timestamp strictly after every turn this session has produced.
    ///
    /// Wall clocks can step backwards; log order must not.
    pub fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    /// Retired by a close; the handle must not be used for new work.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// The most recent `window` turns, oldest first.
    pub fn window(&self, window: usize) -> &[Turn] {
        let start = self.history.len().saturating_sub(window);
        &self.history[start..]
    }

    /// Set the current affect and append a snapshot of it.
    pub fn record_affect(&mut self, affect: AffectVector) -> AffectSnapshot {
        self.affect = affect.sanitized();
        let snapshot = AffectSnapshot::now(self.affect);
        if self.affect_history.len() >= MAX_AFFECT_HISTORY {
            let excess = self.affect_history.len() + 1 - MAX_AFFECT_HISTORY;
            self.affect_history.drain(..excess);
        }
        self.affect_history.push(snapshot);
        snapshot
    }
}

pub type SessionHandle = Arc<tokio::sync::Mutex<SessionState>>;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        // The map holds no invariant a panicking holder could break.
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.map().get(session_id).cloned()
    }

    /// Insert `state` unless the session was opened concurrently, and return
    /// whichever handle ended up registered.
    pub fn insert_if_absent(&self, state: SessionState) -> SessionHandle {
        self.map()
            .entry(state.session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(state)))
            .clone()
    }

    pub fn remove(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.map().remove(session_id)
    }

    /// Open session ids, sorted.
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.map().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_types::Role;

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test]
    fn timestamps_are_strictly_increasing() {
        let mut state = SessionState::new(sid("u1"), AffectVector::NEUTRAL);
        let mut prev = state.next_timestamp();
        for _ in 0..1000 {
            let ts = state.next_timestamp();
            assert!(ts > prev);
            prev = ts;
        }
    }

    #[test]
    fn resumed_session_continues_after_last_logged_turn() {
        let future = Utc::now() + ChronoDuration::hours(1);
        let history = vec![
            Turn::at(sid("u1"), Role::User, "hi", future),
            Turn::at(sid("u1"), Role::Event, "a noise", future),
        ];
        let mut state = SessionState::new(sid("u1"), AffectVector::NEUTRAL).with_history(history);
        assert!(state.next_timestamp() > future);
        assert_eq!(state.event_count, 1);
    }

    #[test]
    fn window_returns_latest_turns() {
        let mut state = SessionState::new(sid("u1"), AffectVector::NEUTRAL);
        for i in 0..5 {
            let ts = state.next_timestamp();
            state.history.push(Turn::at(sid("u1"), Role::User, i.to_string(), ts));
        }
        let texts: Vec<_> = state.window(2).iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["3", "4"]);
        assert_eq!(state.window(50).len(), 5);
        assert!(state.window(0).is_empty());
    }

    #[test]
    fn affect_history_is_capped() {
        let mut state = SessionState::new(sid("u1"), AffectVector::NEUTRAL);
        for _ in 0..MAX_AFFECT_HISTORY + 10 {
            state.record_affect(AffectVector::new(0.7, 0.5, 0.5));
        }
        assert_eq!(state.affect_history.len(), MAX_AFFECT_HISTORY);
        assert_eq!(state.affect.mood, 0.7);
    }

    #[test]
    fn registry_keeps_first_inserted_handle() {
        let registry = SessionRegistry::new();
        let first = registry.insert_if_absent(SessionState::new(sid("u1"), AffectVector::NEUTRAL));
        let second =
            registry.insert_if_absent(SessionState::new(sid("u1"), AffectVector::new(0.9, 0.9, 0.9)));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        registry.insert_if_absent(SessionState::new(sid("a0"), AffectVector::NEUTRAL));
        assert_eq!(registry.ids(), [sid("a0"), sid("u1")]);
        assert!(registry.remove(&sid("u1")).is_some());
        assert!(registry.get(&sid("u1")).is_none());
        assert!(registry.remove(&sid("a0")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn closed_state_stays_closed() {
        let mut state = SessionState::new(sid("u1"), AffectVector::NEUTRAL);
        assert!(!state.is_closed());
        state.mark_closed();
        assert!(state.is_closed());
    }
}
