//! `kindred-memory` – The dual memory.
//!
//! Every exchange is written twice: once to an append-only structured log
//! that is the source of truth, and once (best effort) to a semantic index
//! used for similarity-based context retrieval. Both live on a local SQLite
//! substrate.
//!
//! # Modules
//!
//! - [`log_store`] – [`SqliteTurnLog`][log_store::SqliteTurnLog]: durable,
//!   transactional, append-only turn log.
//! - [`semantic_index`] – [`VectorIndex`][semantic_index::VectorIndex] with a
//!   SQLite and an in-memory implementation, ranked by cosine similarity.
//! - [`embedding`] – the [`Embedder`][embedding::Embedder] capability plus an
//!   OpenAI-compatible HTTP adapter and an offline hashing embedder.
//! - [`coordinator`] – [`MemoryCoordinator`][coordinator::MemoryCoordinator]:
//!   two-phase writes and session-scoped retrieval across both stores.
//! - [`affect_log`] – [`AffectLog`][affect_log::AffectLog]: optional durable
//!   affect snapshots so a session's state survives restarts.

pub mod affect_log;
pub mod coordinator;
pub mod embedding;
pub mod log_store;
pub mod semantic_index;

pub use coordinator::{CoordinatorStats, MemoryCoordinator, RetrievalResult};
pub use embedding::{Embedder, HashingEmbedder, HttpEmbedder};
pub use log_store::{LogError, LoggedTurn, SqliteTurnLog, TurnLog};
pub use semantic_index::{InMemoryVectorIndex, IndexError, SqliteVectorIndex, VectorIndex};

/// Apply the pragmas shared by every on-disk store: WAL journaling with full
/// fsync on commit, and a busy timeout so the log and index can share a file.
pub(crate) fn configure_connection(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "FULL")?;
    Ok(())
}
