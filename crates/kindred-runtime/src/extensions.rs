//! Event/Plan Extensions.
//!
//! Optional behaviours layered on top of plain conversation.
//!
//! - [`ExtensionChain`] runs [`TurnExtension`]s in registration order before
//!   the completion call. The first one that returns output replaces the
//!   completion for that turn; errors are logged and the chain moves on.
//! - [`PlanRouter`] is the built-in extension: messages starting with
//!   `/plan ` or `plan:` are decomposed into numbered steps by a [`Planner`].
//! - [`EventCatalog`] and [`EventGenerator`] produce ambient "event" turns
//!   (memories, dreams, startles) keyed by time of day, picked
//!   deterministically per session. [`spawn_event_scheduler`] fires them on a
//!   timer for every open session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kindred_types::{AffectVector, CapabilityError, SessionId, Turn};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::llm_driver::{CompletionModel, plan_prompt};
use crate::orchestrator::Orchestrator;

// ─────────────────────────────────────────────────────────────────────────────
// Extension chain
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only view of the session an extension is asked about.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub session_id: &'a SessionId,
    pub affect: AffectVector,
    pub history: &'a [Turn],
}

/// What an extension produced instead of a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionOutput {
    /// Text stored and returned as the assistant reply.
    pub reply: String,
    pub plan: Option<Vec<String>>,
}

#[async_trait]
pub trait TurnExtension: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` passes the turn on to the next extension.
    async fn handle(
        &self,
        view: &SessionView<'_>,
        input: &str,
    ) -> Result<Option<ExtensionOutput>, CapabilityError>;
}

#[derive(Default, Clone)]
pub struct ExtensionChain {
    extensions: Vec<Arc<dyn TurnExtension>>,
}

impl ExtensionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `ext` at the lowest priority.
    pub fn push(&mut self, ext: Arc<dyn TurnExtension>) {
        self.extensions.push(ext);
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// First `Some` output in priority order, or `None`.
    pub async fn run(&self, view: &SessionView<'_>, input: &str) -> Option<ExtensionOutput> {
        for ext in &self.extensions {
            match ext.handle(view, input).await {
                Ok(Some(out)) => {
                    debug!(extension = ext.name(), session_id = %view.session_id, "extension handled turn");
                    return Some(out);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(extension = ext.name(), session_id = %view.session_id, error = %e, "extension failed; skipping");
                }
            }
        }
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Planning
// ─────────────────────────────────────────────────────────────────────────────

/// Task decomposition capability.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &str) -> Result<Vec<String>, CapabilityError>;
}

/// Extract list items from free text: lines like `1. x`, `2) x`, `- x`, `* x`
/// or `• x`. Other lines are ignored.
pub fn parse_plan_steps(text: &str) -> Vec<String> {
    text.lines().filter_map(list_item).map(str::to_string).collect()
}

fn list_item(line: &str) -> Option<&str> {
    let line = line.trim();
    let rest = if let Some(rest) = line
        .strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .or_else(|| line.strip_prefix("• "))
    {
        rest
    } else {
        let digits = line.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return None;
        }
        let after = &line[digits..];
        after
            .strip_prefix(". ")
            .or_else(|| after.strip_prefix(") "))
            .or_else(|| after.strip_prefix(": "))?
    };
    let rest = rest.trim();
    (!rest.is_empty()).then_some(rest)
}

/// Render steps as `1. a\n2. b`.
pub fn format_plan(steps: &[String]) -> String {
    steps
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {s}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

/// [`Planner`] over any [`CompletionModel`], parsing its numbered reply.
pub struct CompletionPlanner {
    model: Arc<dyn CompletionModel>,
}

impl CompletionPlanner {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Planner for CompletionPlanner {
    async fn plan(&self, task: &str) -> Result<Vec<String>, CapabilityError> {
        let raw = self.model.complete("", &[], &plan_prompt(task)).await?;
        Ok(parse_plan_steps(&raw))
    }
}

const PLAN_PREFIXES: [&str; 2] = ["/plan ", "plan:"];

/// The task following a plan directive, if `input` is one.
pub fn plan_directive(input: &str) -> Option<&str> {
    let trimmed = input.trim_start();
    PLAN_PREFIXES.iter().find_map(|prefix| {
        let head = trimmed.get(..prefix.len())?;
        if !head.eq_ignore_ascii_case(prefix) {
            return None;
        }
        let task = trimmed[prefix.len()..].trim();
        (!task.is_empty()).then_some(task)
    })
}

/// Routes plan directives to a [`Planner`] under a timeout.
pub struct PlanRouter {
    planner: Arc<dyn Planner>,
    timeout: Duration,
}

impl PlanRouter {
    pub fn new(planner: Arc<dyn Planner>, timeout: Duration) -> Self {
        Self { planner, timeout }
    }
}

#[async_trait]
impl TurnExtension for PlanRouter {
    fn name(&self) -> &'static str {
        "plan"
    }

    async fn handle(
        &self,
        _view: &SessionView<'_>,
        input: &str,
    ) -> Result<Option<ExtensionOutput>, CapabilityError> {
        let Some(task) = plan_directive(input) else {
            return Ok(None);
        };
        let steps = tokio::time::timeout(self.timeout, self.planner.plan(task))
            .await
            .map_err(|_| CapabilityError::Timeout(self.timeout))??;
        if steps.is_empty() {
            debug!(task, "planner returned no steps; falling back to completion");
            return Ok(None);
        }
        Ok(Some(ExtensionOutput {
            reply: format_plan(&steps),
            plan: Some(steps),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ambient events
// ─────────────────────────────────────────────────────────────────────────────

pub const DAY_KEY: &str = "day";
pub const NIGHT_KEY: &str = "night";

/// Event templates grouped by context key.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCatalog {
    entries: BTreeMap<String, Vec<String>>,
}

impl Default for EventCatalog {
    fn default() -> Self {
        let mut catalog = Self::empty();
        catalog.insert(
            DAY_KEY,
            [
                "You remember a vivid childhood memory of playing in the rain.",
                "A sudden noise startles you and makes you wary.",
                "You feel a surge of energy as if you have just woken from a nap.",
                "Sunlight through the window puts you in a lighter mood.",
            ],
        );
        catalog.insert(
            NIGHT_KEY,
            [
                "You have a strange dream in which you are flying over mountains.",
                "You recall a moment when someone close to you betrayed your trust.",
                "The quiet of the night makes you feel calm and reflective.",
                "You half-wake from a dream you cannot quite remember.",
            ],
        );
        catalog
    }
}

impl EventCatalog {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Add templates under `key`; blank templates are dropped.
    pub fn insert<I, S>(&mut self, key: impl Into<String>, templates: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let list = self.entries.entry(key.into()).or_default();
        list.extend(
            templates
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.trim().is_empty()),
        );
    }

    pub fn templates(&self, key: &str) -> &[String] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// `day` from 06:00 up to 18:00, `night` otherwise.
    pub fn key_for_hour(hour: u32) -> &'static str {
        if (6..18).contains(&hour) { DAY_KEY } else { NIGHT_KEY }
    }
}

/// Deterministic selector over an [`EventCatalog`].
#[derive(Debug, Clone, Default)]
pub struct EventGenerator {
    catalog: EventCatalog,
}

impl EventGenerator {
    pub fn new(catalog: EventCatalog) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &EventCatalog {
        &self.catalog
    }

    /// Template for the `event_count`-th event of `session_id` under `key`.
    ///
    /// The index is `fnv1a(session_id ‖ event_count) mod len`, so the same
    /// session replays the same sequence and different sessions diverge.
    pub fn pick(&self, session_id: &SessionId, event_count: u64, key: &str) -> Option<&str> {
        let list = self.catalog.templates(key);
        if list.is_empty() {
            return None;
        }
        let mut bytes = session_id.as_str().as_bytes().to_vec();
        bytes.extend_from_slice(&event_count.to_le_bytes());
        let idx = (fnv1a(&bytes) % list.len() as u64) as usize;
        Some(list[idx].as_str())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

/// Fire an ambient event for every open session every `interval`.
///
/// Returns `None` (and spawns nothing) when `interval` is zero. The first
/// event fires one full interval after the call.
pub fn spawn_event_scheduler(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
) -> Option<JoinHandle<()>> {
    if interval.is_zero() {
        return None;
    }
    info!(interval_secs = interval.as_secs_f64(), "ambient event scheduler started");
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for session_id in orchestrator.sessions() {
                match orchestrator.trigger_event_now(&session_id).await {
                    Ok(Some(turn)) => debug!(session_id = %session_id, event = %turn.text, "ambient event"),
                    Ok(None) => {}
                    Err(e) => warn!(session_id = %session_id, error = %e, "ambient event failed"),
                }
            }
        }
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
