//! Configuration Vault – reads/writes `~/.kindred/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kindred_runtime::AffectConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid model name {0:?}: use 1-128 characters of letters, digits and . _ : / -")]
    InvalidModel(String),
    #[error("invalid temperature {0}: use a value from 0.0 to 2.0")]
    InvalidTemperature(f32),
}

/// Where completions come from. All of them speak the OpenAI wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiProvider {
    #[default]
    Ollama,
    OpenAI,
    /// Any other OpenAI-compatible server (llama.cpp, vLLM, ...).
    Custom,
}

impl AiProvider {
    pub fn default_base_url(self) -> &'static str {
        match self {
            AiProvider::Ollama | AiProvider::Custom => "http://localhost:11434",
            AiProvider::OpenAI => "https://api.openai.com",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(AiProvider::Ollama),
            "openai" => Some(AiProvider::OpenAI),
            "custom" => Some(AiProvider::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for AiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AiProvider::Ollama => write!(f, "ollama"),
            AiProvider::OpenAI => write!(f, "openai"),
            AiProvider::Custom => write!(f, "custom"),
        }
    }
}

/// How turns are embedded for the semantic index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Offline feature hashing; no server needed.
    #[default]
    Hashing,
    /// `/v1/embeddings` on the configured base URL.
    Http,
    /// No semantic index; retrieval is disabled.
    None,
}

/// Persisted user configuration stored in `~/.kindred/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provider: AiProvider,
    /// Completion model name (e.g. "llama3", "gpt-4o-mini").
    pub model: String,
    /// Base URL of the OpenAI-compatible server, without `/v1`.
    pub base_url: String,
    /// API key sent as a bearer token. Stored in plain text; the file is
    /// created owner-only.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    /// Directory holding `kindred.db`. Defaults to `~/.kindred/data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// HTTP port for `kindred serve`.
    pub port: u16,
    /// Turns recalled from memory per message.
    pub top_k: usize,
    /// Recent turns sent with every completion request.
    pub history_window: usize,
    /// Sampling temperature for completions, 0.0 to 2.0.
    pub temperature: f32,
    pub completion_timeout_secs: u64,
    pub embed_timeout_secs: u64,
    pub embedding: EmbeddingBackend,
    pub embedding_model: String,
    /// Vector width for the `hashing` backend.
    pub hashing_dims: usize,
    /// Seconds between ambient events per open session; 0 disables them.
    pub event_interval_secs: u64,
    /// Keep affect snapshots on disk so sessions resume their mood.
    pub persist_affect: bool,
    /// Optional persona JSON file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona_path: Option<PathBuf>,
    pub affect: AffectConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                if self.api_key.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("data_dir", &self.data_dir)
            .field("port", &self.port)
            .field("top_k", &self.top_k)
            .field("history_window", &self.history_window)
            .field("temperature", &self.temperature)
            .field("completion_timeout_secs", &self.completion_timeout_secs)
            .field("embed_timeout_secs", &self.embed_timeout_secs)
            .field("embedding", &self.embedding)
            .field("embedding_model", &self.embedding_model)
            .field("hashing_dims", &self.hashing_dims)
            .field("event_interval_secs", &self.event_interval_secs)
            .field("persist_affect", &self.persist_affect)
            .field("persona_path", &self.persona_path)
            .field("affect", &self.affect)
            .finish()
    }
}

impl Drop for Config {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: AiProvider::default(),
            model: "llama3".to_string(),
            base_url: AiProvider::default().default_base_url().to_string(),
            api_key: String::new(),
            data_dir: None,
            port: kindred_server::DEFAULT_PORT,
            top_k: 3,
            history_window: 20,
            temperature: kindred_runtime::llm_driver::DEFAULT_TEMPERATURE,
            completion_timeout_secs: 60,
            embed_timeout_secs: 10,
            embedding: EmbeddingBackend::default(),
            embedding_model: "nomic-embed-text".to_string(),
            hashing_dims: kindred_memory::embedding::DEFAULT_HASHING_DIMS,
            event_interval_secs: 600,
            persist_affect: true,
            persona_path: None,
            affect: AffectConfig::default(),
        }
    }
}

impl Config {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs.max(1))
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs.max(1))
    }

    pub fn event_interval(&self) -> Duration {
        Duration::from_secs(self.event_interval_secs)
    }

    pub fn api_key(&self) -> Option<String> {
        (!self.api_key.is_empty()).then(|| self.api_key.clone())
    }

    /// Data directory, falling back to `<home>/.kindred/data`.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| kindred_dir_for_home(&home_dir()).join("data"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidTemperature(self.temperature));
        }
        validate_model_name(&self.model)?;
        validate_model_name(&self.embedding_model)
    }
}

/// Model names go into URLs and JSON bodies; keep them boring.
pub fn validate_model_name(name: &str) -> Result<(), ConfigError> {
    let ok = !name.is_empty()
        && name.chars().count() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '-'));
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidModel(name.to_string()))
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn kindred_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".kindred")
}

/// Return the path to `~/.kindred/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    kindred_dir_for_home(home).join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

/// Apply `KINDRED_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `KINDRED_BASE_URL` | `base_url` |
/// | `KINDRED_MODEL` | `model` |
/// | `KINDRED_API_KEY` | `api_key` |
/// | `KINDRED_DATA_DIR` | `data_dir` |
/// | `KINDRED_PORT` | `port` |
/// | `KINDRED_TOP_K` | `top_k` |
/// | `KINDRED_TEMPERATURE` | `temperature` |
///
/// Unparseable numbers are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("KINDRED_BASE_URL") {
        cfg.base_url = v;
    }
    if let Some(v) = var("KINDRED_MODEL") {
        cfg.model = v;
    }
    if let Some(v) = var("KINDRED_API_KEY") {
        cfg.api_key = v;
    }
    if let Some(v) = var("KINDRED_DATA_DIR") {
        cfg.data_dir = Some(PathBuf::from(v));
    }
    if let Some(port) = var("KINDRED_PORT").and_then(|v| v.parse::<u16>().ok()) {
        cfg.port = port;
    }
    if let Some(k) = var("KINDRED_TOP_K").and_then(|v| v.parse::<usize>().ok()) {
        cfg.top_k = k;
    }
    if let Some(t) = var("KINDRED_TEMPERATURE").and_then(|v| v.parse::<f32>().ok()) {
        cfg.temperature = t;
    }
}

/// Save the config to disk, creating `~/.kindred/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    cfg.validate()?;
    let write_err = |source| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    // Owner-only file (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(write_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(write_err)?;
    Ok(())
}
