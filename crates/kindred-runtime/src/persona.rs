//! Persona – who the companion is.
//!
//! A persona is a small JSON document naming the character, describing it,
//! listing a few traits and fixing the baseline mood/trust/energy that a new
//! session starts from:
//!
//! ```json
//! {
//!   "name": "Wren",
//!   "description": "a thoughtful night-owl who loves old films",
//!   "traits": ["curious", "dry humour"],
//!   "baseline_mood": 0.6,
//!   "baseline_trust": 0.4,
//!   "baseline_energy": 0.5
//! }
//! ```

use std::path::Path;

use kindred_types::{AFFECT_BASELINE, AffectVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersonaError {
    #[error("cannot read persona file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid persona JSON: {0}")]
    Json(#[from] serde_json::Error),
}

fn default_baseline() -> f32 {
    AFFECT_BASELINE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default = "default_baseline")]
    pub baseline_mood: f32,
    #[serde(default = "default_baseline")]
    pub baseline_trust: f32,
    #[serde(default = "default_baseline")]
    pub baseline_energy: f32,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "Kindred".to_string(),
            description: "a warm, attentive companion who remembers what matters to the user"
                .to_string(),
            traits: vec!["curious".to_string(), "supportive".to_string()],
            baseline_mood: AFFECT_BASELINE,
            baseline_trust: AFFECT_BASELINE,
            baseline_energy: AFFECT_BASELINE,
        }
    }
}

impl Persona {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersonaError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| PersonaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, PersonaError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Baselines as a sanitized [`AffectVector`].
    pub fn baseline(&self) -> AffectVector {
        AffectVector::new(self.baseline_mood, self.baseline_trust, self.baseline_energy)
    }

    /// Opening paragraph of every system prompt.
    pub fn system_prompt(&self) -> String {
        let mut prompt = format!("You are {}", self.name);
        if !self.description.is_empty() {
            prompt.push_str(", ");
            prompt.push_str(&self.description);
        }
        prompt.push('.');
        if !self.traits.is_empty() {
            prompt.push_str(&format!(" Your traits: {}.", self.traits.join(", ")));
        }
        prompt.push_str(" Stay in character and answer conversationally.");
        prompt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_baselines_default_to_neutral() {
        let p = Persona::from_json(r#"{"name": "Wren"}"#).unwrap();
        assert_eq!(p.baseline(), AffectVector::NEUTRAL);
        assert!(p.traits.is_empty());
    }

    #[test]
    fn out_of_range_baselines_are_clamped() {
        let p = Persona::from_json(r#"{"name": "Wren", "baseline_mood": 1.4, "baseline_trust": -2}"#)
            .unwrap();
        let b = p.baseline();
        assert_eq!(b.mood, 1.0);
        assert_eq!(b.trust, 0.0);
    }

    #[test]
    fn system_prompt_mentions_name_and_traits() {
        let p = Persona {
            name: "Wren".into(),
            description: "a night owl".into(),
            traits: vec!["curious".into(), "dry humour".into()],
            ..Persona::default()
        };
        let prompt = p.system_prompt();
        assert!(prompt.starts_with("You are Wren, a night owl."));
        assert!(prompt.contains("curious, dry humour"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wren.json");
        std::fs::write(&path, r#"{"name": "Wren", "baseline_energy": 0.8}"#).unwrap();
        let p = Persona::load(&path).unwrap();
        assert_eq!(p.name, "Wren");
        assert!((p.baseline().energy - 0.8).abs() < 1e-6);
    }

    #[test]
    fn load_reports_missing_file_and_bad_json() {
        assert!(matches!(
            Persona::load("/definitely/not/here.json"),
            Err(PersonaError::Io { .. })
        ));
        assert!(matches!(Persona::from_json("{"), Err(PersonaError::Json(_))));
    }
}
