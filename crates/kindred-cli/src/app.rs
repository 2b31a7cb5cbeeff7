//! Boot sequence – assembles an [`Orchestrator`] from a [`Config`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use kindred_memory::affect_log::AffectLog;
use kindred_memory::{
    Embedder, HashingEmbedder, HttpEmbedder, IndexError, LogError, MemoryCoordinator,
    SqliteTurnLog, SqliteVectorIndex,
};
use kindred_middleware::EventBus;
use kindred_runtime::{
    AffectEngine, CompletionModel, ExtensionChain, LexiconSentiment, LlmDriver, Orchestrator,
    OrchestratorConfig, Persona, PersonaError, PlanRouter, Planner, SentimentScorer,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{Config, EmbeddingBackend};

/// File inside the data directory holding the log, index and affect tables.
pub const DB_FILE: &str = "kindred.db";

#[derive(Error, Debug)]
pub enum BootError {
    #[error("cannot create data directory {path}: {source}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("turn log: {0}")]
    Log(#[from] LogError),
    #[error("semantic index: {0}")]
    Index(#[from] IndexError),
    #[error("persona: {0}")]
    Persona(#[from] PersonaError),
}

/// Everything a front-end needs to talk to the companion.
pub struct Companion {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: EventBus,
    pub driver: Arc<LlmDriver>,
    pub db_path: PathBuf,
}

/// Open the stores under `cfg.data_dir()` and wire up the runtime.
pub fn boot(cfg: &Config) -> Result<Companion, BootError> {
    let data_dir = cfg.data_dir();
    boot_in(cfg, &data_dir)
}

pub(crate) fn boot_in(cfg: &Config, data_dir: &Path) -> Result<Companion, BootError> {
    // ── 1. Memory ──
    std::fs::create_dir_all(data_dir).map_err(|source| BootError::DataDir {
        path: data_dir.display().to_string(),
        source,
    })?;
    let db_path = data_dir.join(DB_FILE);
    let db = db_path.to_string_lossy();
    let log = Arc::new(SqliteTurnLog::open(&db)?);
    let index = Arc::new(SqliteVectorIndex::open(&db)?);
    let memory = MemoryCoordinator::new(log, index)
        .with_embedder(embedder_for(cfg))
        .with_embed_timeout(cfg.embed_timeout());
    info!(path = %db_path.display(), embedding = ?cfg.embedding, "memory opened");

    let affect_log = if cfg.persist_affect {
        Some(Arc::new(AffectLog::open(&db)?))
    } else {
        None
    };

    // ── 2. Persona and affect ──
    let persona = match &cfg.persona_path {
        Some(path) => Persona::load(path)?,
        None => Persona::default(),
    };
    let scorer: Arc<dyn SentimentScorer> = Arc::new(LexiconSentiment::new());
    let engine = AffectEngine::new(cfg.affect.clone()).with_scorer(Some(scorer));

    // ── 3. Language model and extensions ──
    let driver = Arc::new(
        LlmDriver::new(&cfg.base_url, &cfg.model)
            .with_api_key(cfg.api_key())
            .with_temperature(cfg.temperature),
    );
    let completion: Arc<dyn CompletionModel> = driver.clone();
    let planner: Arc<dyn Planner> = driver.clone();
    let mut extensions = ExtensionChain::new();
    extensions.push(Arc::new(PlanRouter::new(planner.clone(), cfg.completion_timeout())));

    // ── 4. Orchestrator ──
    let bus = EventBus::default();
    let config = OrchestratorConfig {
        history_window: cfg.history_window,
        retrieval_k: cfg.top_k,
        completion_timeout: cfg.completion_timeout(),
    };
    let orchestrator = Orchestrator::new(Arc::new(memory), config)
        .with_persona(persona)
        .with_affect_engine(engine)
        .with_completion(Some(completion))
        .with_extensions(extensions)
        .with_planner(Some(planner))
        .with_affect_log(affect_log)
        .with_bus(bus.clone());
    info!(persona = %orchestrator.persona().name, model = %cfg.model, "companion ready");

    Ok(Companion {
        orchestrator: Arc::new(orchestrator),
        bus,
        driver,
        db_path,
    })
}

fn embedder_for(cfg: &Config) -> Option<Arc<dyn Embedder>> {
    match cfg.embedding {
        EmbeddingBackend::Hashing => {
            let embedder = HashingEmbedder::new(cfg.hashing_dims);
            debug!(dims = embedder.dims(), "offline hashing embedder");
            Some(Arc::new(embedder))
        }
        EmbeddingBackend::Http => Some(Arc::new(
            HttpEmbedder::new(&cfg.base_url, &cfg.embedding_model).with_api_key(cfg.api_key()),
        )),
        EmbeddingBackend::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kindred_types::{Role, SessionId};

    fn offline_config() -> Config {
        let mut cfg = Config::default();
        // Nothing listens here; completions fall back.
        cfg.base_url = "http://127.0.0.1:9".to_string();
        cfg.completion_timeout_secs = 1;
        cfg
    }

    #[tokio::test]
    async fn boot_creates_database_and_survives_restart() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cfg = offline_config();
        let sid = SessionId::parse("restart-check")?;

        {
            let companion = boot_in(&cfg, dir.path())?;
            assert!(companion.db_path.exists());
            let reply = companion.orchestrator.handle_message(&sid, "hello there").await?;
            assert!(!reply.reply.is_empty());
            companion.orchestrator.shutdown().await;
        }

        let companion = boot_in(&cfg, dir.path())?;
        let history = companion.orchestrator.history(&sid)?;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].role, Role::Assistant);
        Ok(())
    }

    #[test]
    fn missing_persona_file_is_a_boot_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = offline_config();
        cfg.persona_path = Some(dir.path().join("nope.json"));
        assert!(matches!(boot_in(&cfg, dir.path()), Err(BootError::Persona(_))));
    }

    #[test]
    fn persona_file_sets_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persona.json");
        std::fs::write(&path, r#"{"name": "Wren", "baseline_mood": 0.7}"#).unwrap();
        let mut cfg = offline_config();
        cfg.persona_path = Some(path);
        cfg.embedding = EmbeddingBackend::None;
        let companion = boot_in(&cfg, dir.path()).unwrap();
        assert_eq!(companion.orchestrator.persona().name, "Wren");
    }
}
