//! Memory Coordinator.
//!
//! Keeps the structured log and the semantic index consistent under partial
//! failure. The log is canonical; the index is derived and best effort.
//!
//! # Write path
//!
//! 1. Append to the log. Failure here is the only error [`MemoryCoordinator::store`]
//!    reports.
//! 2. Embed the text (bounded by `embed_timeout`) and upsert into the index.
//!    Failure is logged, counted in [`CoordinatorStats`], and left for
//!    [`MemoryCoordinator::reindex`] to repair.
//!
//! # Read path
//!
//! [`MemoryCoordinator::retrieve`] embeds the query, asks the index for the
//! session's nearest records, and resolves each hit against the log. A hit
//! whose log record is missing or belongs to another session is dropped. Any
//! failure yields an empty result rather than an error.
//!
//! Log and index calls are synchronous SQLite work and run on tokio's
//! blocking pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kindred_types::{CapabilityError, CompanionError, RecordId, SessionId, Turn};
use serde::Serialize;
use tokio::task::JoinError;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::log_store::TurnLog;
use crate::semantic_index::VectorIndex;

/// Ranked `(turn, cosine)` pairs, best first, at most `k` long.
pub type RetrievalResult = Vec<(Turn, f32)>;

pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// Stats
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time copy of the coordinator's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub stored: u64,
    pub indexed: u64,
    pub embed_failures: u64,
    pub index_failures: u64,
    pub retrieval_failures: u64,
}

#[derive(Default)]
struct Counters {
    stored: AtomicU64,
    indexed: AtomicU64,
    embed_failures: AtomicU64,
    index_failures: AtomicU64,
    retrieval_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            stored: self.stored.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            embed_failures: self.embed_failures.load(Ordering::Relaxed),
            index_failures: self.index_failures.load(Ordering::Relaxed),
            retrieval_failures: self.retrieval_failures.load(Ordering::Relaxed),
        }
    }
}

/// Run a synchronous store call on the blocking pool.
async fn blocking<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<JoinError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryCoordinator
// ─────────────────────────────────────────────────────────────────────────────

pub struct MemoryCoordinator {
    log: Arc<dyn TurnLog>,
    index: Arc<dyn VectorIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    embed_timeout: Duration,
    counters: Counters,
}

impl MemoryCoordinator {
    /// Coordinator without an embedder: every turn is logged, nothing is
    /// indexed, and retrieval always comes back empty.
    pub fn new(log: Arc<dyn TurnLog>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            log,
            index,
            embedder: None,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
            counters: Counters::default(),
        }
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn Embedder>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.counters.snapshot()
    }

    /// Durably record `turn` under the session it names, then index it on a
    /// best-effort basis.
    ///
    /// # Errors
    ///
    /// [`CompanionError::Persistence`] if the log append fails. Indexing
    /// failures never surface here.
    pub async fn store(&self, turn: &Turn) -> Result<RecordId, CompanionError> {
        // ── Phase 1: canonical log ──
        let log = Arc::clone(&self.log);
        let owned = turn.clone();
        let logged = blocking(move || log.append(&owned)).await?;
        Counters::bump(&self.counters.stored);
        debug!(
            session_id = %turn.session_id,
            record_id = %logged.id,
            seq = logged.seq,
            "turn logged"
        );

        // ── Phase 2: derived index ──
        if let Err(e) = self.index_turn(logged.id, turn).await {
            warn!(
                session_id = %turn.session_id,
                record_id = %logged.id,
                error = %e,
                "indexing failed; record kept in log only"
            );
        }
        Ok(logged.id)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| CapabilityError::Unavailable("no embedder configured".into()))?;
        tokio::time::timeout(self.embed_timeout, embedder.embed(text))
            .await
            .map_err(|_| CapabilityError::Timeout(self.embed_timeout))?
    }

    async fn index_turn(&self, id: RecordId, turn: &Turn) -> Result<(), CompanionError> {
        if self.embedder.is_none() {
            return Ok(());
        }
        let embedding = self.embed(&turn.text).await.inspect_err(|_| {
            Counters::bump(&self.counters.embed_failures);
        })?;
        let index = Arc::clone(&self.index);
        let session_id = turn.session_id.clone();
        blocking(move || index.upsert(id, &session_id, &embedding))
            .await
            .inspect_err(|_| Counters::bump(&self.counters.index_failures))?;
        Counters::bump(&self.counters.indexed);
        Ok(())
    }

    /// Up to `k` turns from `session_id` most similar to `query`.
    ///
    /// Never fails: embedder, index and log errors all degrade to fewer (or
    /// zero) results.
    pub async fn retrieve(&self, session_id: &SessionId, query: &str, k: usize) -> RetrievalResult {
        if k == 0 || self.embedder.is_none() {
            return Vec::new();
        }

        let embedding = match self.embed(query).await {
            Ok(e) => e,
            Err(e) => {
                Counters::bump(&self.counters.retrieval_failures);
                warn!(session_id = %session_id, error = %e, "retrieval embedding failed");
                return Vec::new();
            }
        };

        let index = Arc::clone(&self.index);
        let owner = session_id.clone();
        let hits = match blocking(move || index.query(&owner, &embedding, k)).await {
            Ok(h) => h,
            Err(e) => {
                Counters::bump(&self.counters.retrieval_failures);
                warn!(session_id = %session_id, error = %e, "index query failed");
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            let log = Arc::clone(&self.log);
            match blocking(move || log.get(id)).await {
                Ok(Some(rec)) if &rec.turn.session_id == session_id => {
                    results.push((rec.turn, score));
                }
                Ok(Some(rec)) => {
                    warn!(
                        session_id = %session_id,
                        record_id = %id,
                        owner = %rec.turn.session_id,
                        "index hit belongs to another session; dropped"
                    );
                }
                Ok(None) => {
                    debug!(record_id = %id, "index hit has no log record; dropped");
                }
                Err(e) => {
                    warn!(record_id = %id, error = %e, "log lookup failed during retrieval");
                }
            }
        }
        results.truncate(k);
        results
    }

    /// The durable history of `session_id`, oldest first.
    pub fn history(&self, session_id: &SessionId) -> Result<Vec<Turn>, CompanionError> {
        Ok(self.log.read_all(session_id)?)
    }

    /// Sessions with at least one logged turn.
    pub fn logged_sessions(&self) -> Result<Vec<SessionId>, CompanionError> {
        Ok(self.log.sessions()?)
    }

    /// Index every log record of `session_id` that the index is missing.
    /// Returns how many records were newly indexed.
    pub async fn reindex(&self, session_id: &SessionId) -> Result<usize, CompanionError> {
        if self.embedder.is_none() {
            return Ok(0);
        }
        let log = Arc::clone(&self.log);
        let owner = session_id.clone();
        let records = blocking(move || log.read_since(&owner, 0)).await?;
        let mut repaired = 0;
        for rec in records {
            if self.index.contains(rec.id).unwrap_or(false) {
                continue;
            }
            match self.index_turn(rec.id, &rec.turn).await {
                Ok(()) => repaired += 1,
                Err(e) => warn!(record_id = %rec.id, error = %e, "reindex failed for record"),
            }
        }
        Ok(repaired)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
