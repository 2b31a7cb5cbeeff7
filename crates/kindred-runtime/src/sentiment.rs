//! Sentiment capability.
//!
//! [`SentimentScorer`] maps text to a polarity in `[-1, 1]`. The affect
//! engine treats it as optional: an absent or failing scorer means neutral.
//!
//! [`LexiconSentiment`] is a small rule-based scorer in the VADER family:
//! word valences on a ±4 scale, adjusted for preceding negations and
//! degree modifiers, a contrastive `but`, and trailing exclamation marks, then
//! squashed with `x / sqrt(x² + 15)`.

use std::collections::HashMap;

use kindred_types::CapabilityError;

/// Text-to-polarity capability. Implementations must be deterministic.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> Result<f32, CapabilityError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Lexicon tables
// ─────────────────────────────────────────────────────────────────────────────

const VALENCES: &[(&str, f32)] = &[
    // positive
    ("love", 3.2),
    ("loved", 2.9),
    ("loving", 2.9),
    ("adore", 3.0),
    ("like", 1.5),
    ("liked", 1.8),
    ("enjoy", 2.2),
    ("enjoyed", 2.3),
    ("happy", 2.7),
    ("glad", 2.0),
    ("great", 3.1),
    ("good", 1.9),
    ("nice", 1.8),
    ("wonderful", 2.7),
    ("amazing", 2.8),
    ("awesome", 3.1),
    ("excellent", 2.7),
    ("fantastic", 2.6),
    ("beautiful", 2.9),
    ("best", 3.2),
    ("fun", 2.3),
    ("thanks", 1.9),
    ("thank", 1.5),
    ("grateful", 2.0),
    ("excited", 1.4),
    ("calm", 1.3),
    ("hope", 1.9),
    ("trust", 2.3),
    ("friend", 2.2),
    ("kind", 2.4),
    ("sweet", 2.0),
    ("proud", 2.1),
    ("relieved", 1.5),
    ("yes", 1.7),
    ("perfect", 2.7),
    ("cool", 1.3),
    ("safe", 1.9),
    ("warm", 0.9),
    // negative
    ("hate", -2.7),
    ("hated", -3.2),
    ("awful", -2.0),
    ("terrible", -2.1),
    ("horrible", -2.5),
    ("bad", -2.5),
    ("worst", -3.1),
    ("sad", -2.1),
    ("angry", -2.3),
    ("upset", -1.6),
    ("annoyed", -1.6),
    ("annoying", -1.7),
    ("tired", -1.9),
    ("bored", -1.1),
    ("boring", -1.3),
    ("lonely", -1.5),
    ("afraid", -1.9),
    ("scared", -1.9),
    ("worried", -1.2),
    ("anxious", -1.0),
    ("hurt", -2.4),
    ("pain", -2.3),
    ("cry", -2.1),
    ("stupid", -2.4),
    ("useless", -1.8),
    ("disappointed", -1.9),
    ("disappointing", -2.2),
    ("betrayed", -3.0),
    ("betrayal", -2.7),
    ("lie", -1.6),
    ("lied", -1.6),
    ("fail", -2.5),
    ("failed", -2.3),
    ("wrong", -2.1),
    ("sorry", -0.3),
    ("no", -1.2),
    ("miserable", -2.2),
    ("frustrated", -2.4),
    ("disgusting", -2.4),
];

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "nothing", "nobody", "none", "neither", "nor", "without", "cannot",
    "cant", "can't", "dont", "don't", "doesnt", "doesn't", "didnt", "didn't", "isnt", "isn't",
    "wasnt", "wasn't", "arent", "aren't", "wont", "won't", "wouldnt", "wouldn't", "shouldnt",
    "shouldn't", "aint", "ain't",
];

const BOOSTERS: &[&str] = &[
    "very", "really", "so", "extremely", "incredibly", "absolutely", "totally", "completely",
    "truly", "super", "deeply", "especially", "utterly",
];

const DAMPENERS: &[&str] = &[
    "slightly", "somewhat", "kinda", "sorta", "barely", "hardly", "little", "marginally",
];

const BOOST: f32 = 0.293;
const NEGATION_SCALAR: f32 = -0.74;
const CAPS_EMPHASIS: f32 = 0.733;
const EXCLAMATION_BOOST: f32 = 0.292;
const MAX_EXCLAMATIONS: usize = 4;
const ALPHA: f32 = 15.0;

// ─────────────────────────────────────────────────────────────────────────────
// LexiconSentiment
// ─────────────────────────────────────────────────────────────────────────────

pub struct LexiconSentiment {
    valences: HashMap<&'static str, f32>,
}

impl Default for LexiconSentiment {
    fn default() -> Self {
        Self {
            valences: VALENCES.iter().copied().collect(),
        }
    }
}

impl LexiconSentiment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compound polarity in `[-1, 1]`.
    pub fn polarity(&self, text: &str) -> f32 {
        let raw: Vec<&str> = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\''))
            .filter(|w| !w.is_empty())
            .collect();
        if raw.is_empty() {
            return 0.0;
        }
        let lower: Vec<String> = raw.iter().map(|w| w.to_lowercase()).collect();
        let mixed_case = raw.iter().any(|w| w.chars().any(char::is_lowercase));

        let but_at = lower.iter().position(|w| w == "but");
        let mut sum = 0.0f32;

        for (i, word) in lower.iter().enumerate() {
            let Some(&base) = self.valences.get(word.as_str()) else {
                continue;
            };
            let mut v = base;

            if mixed_case && is_shouting(raw[i]) {
                v += CAPS_EMPHASIS * v.signum();
            }

            // Degree modifier directly before the word.
            if i > 0 {
                let prev = lower[i - 1].as_str();
                if BOOSTERS.contains(&prev) {
                    v += BOOST * v.signum();
                } else if DAMPENERS.contains(&prev) {
                    v -= BOOST * v.signum();
                }
            }

            // Negation within the three preceding words.
            let window = i.saturating_sub(3)..i;
            if lower[window].iter().any(|w| NEGATIONS.contains(&w.as_str())) {
                v *= NEGATION_SCALAR;
            }

            match but_at {
                Some(b) if i < b => v *= 0.5,
                Some(b) if i > b => v *= 1.5,
                _ => {}
            }

            sum += v;
        }

        if sum != 0.0 {
            let bangs = text.chars().filter(|c| *c == '!').count().min(MAX_EXCLAMATIONS);
            sum += bangs as f32 * EXCLAMATION_BOOST * sum.signum();
        }

        (sum / (sum * sum + ALPHA).sqrt()).clamp(-1.0, 1.0)
    }
}

fn is_shouting(word: &str) -> bool {
    word.chars().count() > 1
        && word.chars().any(char::is_alphabetic)
        && !word.chars().any(char::is_lowercase)
}

impl SentimentScorer for LexiconSentiment {
    fn score(&self, text: &str) -> Result<f32, CapabilityError> {
        Ok(self.polarity(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(text: &str) -> f32 {
        LexiconSentiment::new().polarity(text)
    }

    #[test]
    fn clear_positive_and_negative() {
        assert!(p("I love this") > 0.5);
        assert!(p("I hate this") < -0.5);
    }

    #[test]
    fn neutral_text_is_zero() {
        assert_eq!(p("The train leaves at nine."), 0.0);
        assert_eq!(p(""), 0.0);
        assert_eq!(p("!!!"), 0.0);
    }

    #[test]
    fn negation_flips_polarity() {
        assert!(p("this is good") > 0.0);
        assert!(p("this is not good") < 0.0);
        assert!(p("I don't hate it") > 0.0);
    }

    #[test]
    fn boosters_and_dampeners_scale() {
        assert!(p("very good") > p("good"));
        assert!(p("slightly good") < p("good"));
        assert!(p("slightly good") > 0.0);
    }

    #[test]
    fn exclamations_intensify() {
        assert!(p("great!!!") > p("great"));
        assert!(p("awful!!") < p("awful"));
    }

    #[test]
    fn but_shifts_weight_to_second_clause() {
        assert!(p("the food was good but the service was terrible") < 0.0);
    }

    #[test]
    fn shouting_intensifies_in_mixed_case_text() {
        assert!(p("I am so HAPPY today") > p("I am so happy today"));
    }

    #[test]
    fn output_always_bounded() {
        let flood = "love ".repeat(500);
        let v = p(&flood);
        assert!(v <= 1.0 && v > 0.99);
        let flood = "hate worst awful ".repeat(500);
        assert!(p(&flood) >= -1.0);
    }
}
