//! AffectState Engine.
//!
//! A deterministic state machine over [`AffectVector`]. Each exchange is
//! reduced to one polarity `p ∈ [-1, 1]` (a weighted mean of the user and
//! assistant text scores) and applied as:
//!
//! | field  | rule                                                                        |
//! |--------|-----------------------------------------------------------------------------|
//! | mood   | steps toward `(p + 1) / 2` by `min(max_mood_step, mood_gain·|p|)`, no overshoot |
//! | trust  | `+= trust_rate·p` only if the current mood already leans the same way as `p` by at least `trust_gate` |
//! | energy | relaxes toward its baseline by `energy_decay`, then `+= activity_gain·min(1, chars/activity_norm)` |
//!
//! Everything is clamped to `[0, 1]` afterwards. Trust is gated on the mood
//! *before* the update, so a single exchange from a neutral state never moves
//! it; only a sustained run of same-signed exchanges does.

use std::sync::Arc;

use kindred_types::AffectVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::sentiment::SentimentScorer;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tunable rates; loaded from the `[affect]` table of the CLI config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffectConfig {
    /// Weight of the user's text in the exchange polarity.
    pub user_weight: f32,
    /// Weight of the assistant's reply in the exchange polarity.
    pub assistant_weight: f32,
    pub max_mood_step: f32,
    pub mood_gain: f32,
    pub trust_rate: f32,
    pub trust_gate: f32,
    pub energy_decay: f32,
    pub activity_gain: f32,
    /// Characters of exchange text that count as full activity.
    pub activity_norm: f32,
}

impl Default for AffectConfig {
    fn default() -> Self {
        Self {
            user_weight: 0.75,
            assistant_weight: 0.25,
            max_mood_step: 0.1,
            mood_gain: 0.125,
            trust_rate: 0.02,
            trust_gate: 0.05,
            energy_decay: 0.1,
            activity_gain: 0.05,
            activity_norm: 200.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AffectEngine
// ─────────────────────────────────────────────────────────────────────────────

pub struct AffectEngine {
    config: AffectConfig,
    baseline: AffectVector,
    scorer: Option<Arc<dyn SentimentScorer>>,
}

impl AffectEngine {
    pub fn new(config: AffectConfig) -> Self {
        Self {
            config,
            baseline: AffectVector::NEUTRAL,
            scorer: None,
        }
    }

    /// Resting point for mood (trust gate) and energy (decay target).
    pub fn with_baseline(mut self, baseline: AffectVector) -> Self {
        self.baseline = baseline.sanitized();
        self
    }

    pub fn with_scorer(mut self, scorer: Option<Arc<dyn SentimentScorer>>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn baseline(&self) -> AffectVector {
        self.baseline
    }

    pub fn config(&self) -> &AffectConfig {
        &self.config
    }

    /// Polarity of a single text; neutral whenever the scorer cannot help.
    pub fn polarity(&self, text: &str) -> f32 {
        let Some(scorer) = &self.scorer else {
            return 0.0;
        };
        match scorer.score(text) {
            Ok(p) if p.is_finite() => p.clamp(-1.0, 1.0),
            Ok(p) => {
                warn!(score = p, "non-finite sentiment score; treating as neutral");
                0.0
            }
            Err(e) => {
                warn!(error = %e, "sentiment scorer failed; treating as neutral");
                0.0
            }
        }
    }

    /// Weighted mean polarity of the non-empty texts of an exchange.
    fn exchange_polarity(&self, user_text: &str, assistant_text: &str) -> f32 {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (text, weight) in [
            (user_text, self.config.user_weight),
            (assistant_text, self.config.assistant_weight),
        ] {
            let weight = if weight.is_finite() { weight.max(0.0) } else { 0.0 };
            if text.trim().is_empty() || weight == 0.0 {
                continue;
            }
            weighted += weight * self.polarity(text);
            total += weight;
        }
        if total > 0.0 { weighted / total } else { 0.0 }
    }

    /// Next affect after one user/assistant exchange.
    pub fn update(&self, current: AffectVector, user_text: &str, assistant_text: &str) -> AffectVector {
        let current = current.sanitized();
        let p = self.exchange_polarity(user_text, assistant_text);
        let chars = user_text.chars().count() + assistant_text.chars().count();
        let next = self.step(current, p, chars);
        debug!(
            polarity = p,
            mood = next.mood,
            trust = next.trust,
            energy = next.energy,
            "affect updated"
        );
        next
    }

    /// Apply an ambient event as a one-sided exchange.
    pub fn apply_event(&self, current: AffectVector, event_text: &str) -> AffectVector {
        self.update(current, event_text, "")
    }

    fn step(&self, current: AffectVector, p: f32, chars: usize) -> AffectVector {
        let c = &self.config;

        // ── mood ──
        let target = (p + 1.0) / 2.0;
        let max_step = (c.mood_gain * p.abs()).min(c.max_mood_step).max(0.0);
        let delta = (target - current.mood).clamp(-max_step, max_step);
        let mood = current.mood + delta;

        // ── trust ──
        let lean = current.mood - self.baseline.mood;
        let agrees = p != 0.0 && lean.signum() == p.signum() && lean.abs() >= c.trust_gate;
        let trust = if agrees {
            current.trust + c.trust_rate * p
        } else {
            current.trust
        };

        // ── energy ──
        let activity = if c.activity_norm > 0.0 {
            (chars as f32 / c.activity_norm).min(1.0)
        } else {
            0.0
        };
        let energy = current.energy
            + c.energy_decay * (self.baseline.energy - current.energy)
            + c.activity_gain * activity;

        AffectVector::new(mood, trust, energy)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_types::CapabilityError;

    /// Scorer that returns a fixed score for known texts and 0 otherwise.
    struct Scripted(Vec<(&'static str, f32)>);

    impl SentimentScorer for Scripted {
        fn score(&self, text: &str) -> Result<f32, CapabilityError> {
            Ok(self
                .0
                .iter()
                .find(|(t, _)| *t == text)
                .map(|(_, s)| *s)
                .unwrap_or(0.0))
        }
    }

    struct Constant(f32);

    impl SentimentScorer for Constant {
        fn score(&self, _text: &str) -> Result<f32, CapabilityError> {
            Ok(self.0)
        }
    }

    struct Broken;

    impl SentimentScorer for Broken {
        fn score(&self, _text: &str) -> Result<f32, CapabilityError> {
            Err(CapabilityError::Unavailable("offline".into()))
        }
    }

    fn engine(scorer: impl SentimentScorer + 'static) -> AffectEngine {
        AffectEngine::new(AffectConfig::default()).with_scorer(Some(Arc::new(scorer)))
    }

    #[test]
    fn love_then_hate_scenario() {
        let e = engine(Scripted(vec![("I love this", 0.8), ("I hate this", -0.7)]));
        let start = AffectVector::NEUTRAL;

        let after_love = e.update(start, "I love this", "Glad to hear it.");
        assert!(after_love.mood > start.mood);
        assert!(after_love.mood - start.mood <= e.config().max_mood_step + 1e-6);
        assert_eq!(after_love.trust, start.trust, "trust is slow-moving");
        assert!(after_love.energy > start.energy);

        let after_hate = e.update(after_love, "I hate this", "I'm sorry.");
        assert!(after_hate.mood < after_love.mood);
        assert!(after_hate.mood >= start.mood - e.config().max_mood_step);
        assert!(after_hate.is_valid());
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let e = engine(crate::sentiment::LexiconSentiment::new());
        let a = e.update(AffectVector::NEUTRAL, "what a wonderful day", "indeed!");
        let b = e.update(AffectVector::NEUTRAL, "what a wonderful day", "indeed!");
        assert_eq!(a, b);
    }

    #[test]
    fn thousand_negative_exchanges_saturate_within_bounds() {
        let e = engine(Constant(-1.0));
        let mut a = AffectVector::NEUTRAL;
        let long = "x".repeat(5_000);
        for _ in 0..1000 {
            a = e.update(a, &long, &long);
            assert!(a.is_valid());
        }
        assert!(a.mood.abs() < 1e-3, "mood saturates at 0, got {}", a.mood);
        assert_eq!(a.trust, 0.0);
    }

    #[test]
    fn thousand_positive_exchanges_saturate_within_bounds() {
        let e = engine(Constant(1.0));
        let mut a = AffectVector::NEUTRAL;
        for _ in 0..1000 {
            a = e.update(a, "yes", "yes");
            assert!(a.is_valid());
        }
        assert!((a.mood - 1.0).abs() < 1e-3);
        assert_eq!(a.trust, 1.0);
    }

    #[test]
    fn mood_never_overshoots_target() {
        let e = engine(Constant(0.1));
        // Target is 0.55; a mood of 0.54 may only rise to exactly 0.55.
        let a = e.update(AffectVector::new(0.54, 0.5, 0.5), "a", "b");
        assert!(a.mood <= 0.55 + 1e-6);
    }

    #[test]
    fn sustained_positive_run_raises_trust() {
        let e = engine(Constant(0.9));
        let mut a = AffectVector::NEUTRAL;
        for _ in 0..5 {
            a = e.update(a, "good", "good");
        }
        assert!(a.trust > 0.5);
    }

    #[test]
    fn missing_or_failing_scorer_is_neutral() {
        let without = AffectEngine::new(AffectConfig::default());
        let failing = engine(Broken);
        let nan = engine(Constant(f32::NAN));
        for e in [&without, &failing, &nan] {
            let a = e.update(AffectVector::NEUTRAL, "anything", "at all");
            assert_eq!(a.mood, 0.5);
            assert_eq!(a.trust, 0.5);
        }
    }

    #[test]
    fn out_of_range_scores_are_clamped() {
        let e = engine(Constant(50.0));
        assert_eq!(e.polarity("x"), 1.0);
    }

    #[test]
    fn energy_decays_toward_baseline_without_activity() {
        let e = AffectEngine::new(AffectConfig::default());
        let mut a = AffectVector::new(0.5, 0.5, 0.95);
        for _ in 0..50 {
            a = e.update(a, "", "");
        }
        assert!((a.energy - 0.5).abs() < 0.01);
    }

    #[test]
    fn event_uses_only_its_own_text() {
        let e = engine(Scripted(vec![("a betrayal", -0.9)]));
        let a = e.apply_event(AffectVector::NEUTRAL, "a betrayal");
        assert!(a.mood < 0.5);
    }

    #[test]
    fn nan_input_state_is_repaired() {
        let e = AffectEngine::new(AffectConfig::default());
        let bad = AffectVector {
            mood: f32::NAN,
            trust: 2.0,
            energy: -1.0,
        };
        assert!(e.update(bad, "hi", "hello").is_valid());
    }
}
