//! `kindred-types` – shared vocabulary for the Kindred companion.
//!
//! Every crate in the workspace speaks in terms of the types defined here:
//! [`Turn`]s recorded in a session, the bounded [`AffectVector`], the bus
//! [`Event`] envelope, and the [`CompanionError`] taxonomy that decides which
//! failures are fatal and which degrade gracefully.

pub mod validation;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use validation::{MAX_MESSAGE_CHARS, MAX_SESSION_ID_CHARS, validate_message};

/// Identifier of a durable record shared by the log store and the index.
pub type RecordId = Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// SessionId
// ─────────────────────────────────────────────────────────────────────────────

/// Validated session identifier.
///
/// Construct with [`SessionId::parse`]; the inner string is guaranteed to be
/// 1–128 characters drawn from `[A-Za-z0-9_.:-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Validate `raw` and wrap it.
    ///
    /// # Errors
    ///
    /// Returns [`CompanionError::Validation`] when `raw` is empty, too long or
    /// contains characters outside the allowed set.
    pub fn parse(raw: impl Into<String>) -> Result<Self, CompanionError> {
        let raw = raw.into();
        validation::validate_session_id(&raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionId {
    type Error = CompanionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Turn
// ─────────────────────────────────────────────────────────────────────────────

/// Who produced a [`Turn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Ambient side message injected by the event generator; never sent
    /// through the completion model as its own turn.
    Event,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "event" => Some(Role::Event),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded utterance. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
}

impl Turn {
    /// Create a turn stamped with the current UTC time.
    pub fn new(session_id: SessionId, role: Role, text: impl Into<String>) -> Self {
        Self::at(session_id, role, text, Utc::now())
    }

    /// Create a turn with an explicit timestamp.
    pub fn at(
        session_id: SessionId,
        role: Role,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp,
            session_id,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AffectVector
// ─────────────────────────────────────────────────────────────────────────────

/// Neutral midpoint used as the fallback for any non-finite affect value.
pub const AFFECT_BASELINE: f32 = 0.5;

/// Bounded mood/trust/energy triple. Every field is in `[0.0, 1.0]` and never
/// NaN; [`AffectVector::new`] enforces this on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffectVector {
    pub mood: f32,
    pub trust: f32,
    pub energy: f32,
}

impl AffectVector {
    /// All three dimensions at [`AFFECT_BASELINE`].
    pub const NEUTRAL: AffectVector = AffectVector {
        mood: AFFECT_BASELINE,
        trust: AFFECT_BASELINE,
        energy: AFFECT_BASELINE,
    };

    /// Build a vector, replacing NaN/∞ with the baseline and clamping to `[0, 1]`.
    pub fn new(mood: f32, trust: f32, energy: f32) -> Self {
        Self {
            mood: unit(mood),
            trust: unit(trust),
            energy: unit(energy),
        }
    }

    /// Re-apply the range invariant to a vector built by field access.
    pub fn sanitized(self) -> Self {
        Self::new(self.mood, self.trust, self.energy)
    }

    /// `true` when every field is finite and within `[0, 1]`.
    pub fn is_valid(&self) -> bool {
        [self.mood, self.trust, self.energy]
            .iter()
            .all(|v| v.is_finite() && (0.0..=1.0).contains(v))
    }
}

impl Default for AffectVector {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

fn unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        AFFECT_BASELINE
    }
}

/// An affect value captured at a point in time, appended after every update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AffectSnapshot {
    pub affect: AffectVector,
    pub timestamp: DateTime<Utc>,
}

impl AffectSnapshot {
    pub fn now(affect: AffectVector) -> Self {
        Self {
            affect,
            timestamp: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus events
// ─────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the in-process event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "kindred-runtime::orchestrator"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data that can be routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A turn was durably recorded.
    TurnRecorded { record_id: RecordId, turn: Turn },
    /// A session's affect changed.
    AffectUpdated {
        session_id: SessionId,
        affect: AffectVector,
    },
    /// A best-effort step failed and the pipeline continued without it.
    Degraded { component: String, message: String },
    SessionClosed(SessionId),
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Failure of an external capability (completion, embedding, sentiment).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityError {
    #[error("capability timed out after {0:?}")]
    Timeout(Duration),

    #[error("capability unavailable: {0}")]
    Unavailable(String),
}

/// Companion-wide error taxonomy.
///
/// Only [`CompanionError::Persistence`] may abort a message exchange after
/// validation; every other variant is absorbed and logged by the component
/// that observes it.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompanionError {
    #[error("Persistence Error: {0}")]
    Persistence(String),

    #[error("Index Error: {0}")]
    Index(String),

    #[error("Capability Error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Validation Error: {0}")]
    Validation(String),
}
