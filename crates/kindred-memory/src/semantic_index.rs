//! Semantic Index.
//!
//! Maps record ids to dense embedding vectors, partitioned by session, and
//! answers top-k cosine-similarity queries. The index is derived data: every
//! entry points at a log record, but a log record may have no entry (the
//! embedding failed, or the index was rebuilt).
//!
//! Two implementations are provided:
//!
//! | type                    | backing                         | readers      |
//! |-------------------------|---------------------------------|--------------|
//! | [`SqliteVectorIndex`]   | `vectors` table, LE f32 BLOBs   | serialized   |
//! | [`InMemoryVectorIndex`] | `RwLock<HashMap>`               | concurrent   |

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use kindred_types::{CompanionError, RecordId, SessionId};
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Embedding vectors must be non-empty")]
    EmptyEmbedding,
    #[error("embedding has {got} dimensions but the index holds {expected}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("index lock poisoned")]
    Poisoned,
}

impl From<IndexError> for CompanionError {
    fn from(e: IndexError) -> Self {
        CompanionError::Index(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Embedding helpers
// ─────────────────────────────────────────────────────────────────────────────

fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Compute the cosine similarity between two equal-length vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` if either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Reject `embedding` when it is empty or differs from the dimension the
/// index already holds (`None` while the index is empty).
fn check_dimensions(held: Option<usize>, embedding: &[f32]) -> Result<(), IndexError> {
    if embedding.is_empty() {
        return Err(IndexError::EmptyEmbedding);
    }
    match held {
        Some(expected) if expected != embedding.len() => Err(IndexError::DimensionMismatch {
            expected,
            got: embedding.len(),
        }),
        _ => Ok(()),
    }
}

/// Score `candidates` against `query` and keep the `k` best (highest first).
fn rank<I>(query: &[f32], candidates: I, k: usize) -> Vec<(RecordId, f32)>
where
    I: IntoIterator<Item = (RecordId, Vec<f32>)>,
{
    let mut scored: Vec<(RecordId, f32)> = candidates
        .into_iter()
        .map(|(id, emb)| (id, cosine_similarity(&emb, query)))
        .filter(|(_, score)| score.is_finite())
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}

// ─────────────────────────────────────────────────────────────────────────────
// VectorIndex trait
// ─────────────────────────────────────────────────────────────────────────────

/// Session-partitioned nearest-neighbour index.
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the embedding stored under `id`.
    fn upsert(&self, id: RecordId, session_id: &SessionId, embedding: &[f32])
    -> Result<(), IndexError>;

    /// Up to `k` `(id, cosine)` pairs from `session_id`, best first.
    fn query(
        &self,
        session_id: &SessionId,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(RecordId, f32)>, IndexError>;

    /// Remove `id`; returns whether it was present.
    fn delete(&self, id: RecordId) -> Result<bool, IndexError>;

    fn contains(&self, id: RecordId) -> Result<bool, IndexError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteVectorIndex
// ─────────────────────────────────────────────────────────────────────────────

pub struct SqliteVectorIndex {
    conn: Mutex<Connection>,
}

impl SqliteVectorIndex {
    /// Open (or create) a persistent index at `path`. May share a file with
    /// the turn log.
    pub fn open(path: &str) -> Result<Self, IndexError> {
        let conn = Connection::open(path)?;
        crate::configure_connection(&conn)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, IndexError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS vectors (
                id         TEXT NOT NULL PRIMARY KEY,
                session_id TEXT NOT NULL,
                embedding  BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS vectors_session ON vectors (session_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, IndexError> {
        self.conn.lock().map_err(|_| IndexError::Poisoned)
    }

    /// Dimension of the stored vectors, if any are stored.
    fn held_dimensions(conn: &Connection) -> Result<Option<usize>, IndexError> {
        let bytes: Option<i64> = conn
            .query_row("SELECT length(embedding) FROM vectors LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(bytes.map(|n| n as usize / 4))
    }
}

impl VectorIndex for SqliteVectorIndex {
    fn upsert(
        &self,
        id: RecordId,
        session_id: &SessionId,
        embedding: &[f32],
    ) -> Result<(), IndexError> {
        let conn = self.lock()?;
        check_dimensions(Self::held_dimensions(&conn)?, embedding)?;
        conn.execute(
            "INSERT OR REPLACE INTO vectors (id, session_id, embedding) VALUES (?1, ?2, ?3)",
            params![
                id.to_string(),
                session_id.as_str(),
                embedding_to_bytes(embedding)
            ],
        )?;
        Ok(())
    }

    fn query(
        &self,
        session_id: &SessionId,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(RecordId, f32)>, IndexError> {
        let conn = self.lock()?;
        check_dimensions(Self::held_dimensions(&conn)?, embedding)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare("SELECT id, embedding FROM vectors WHERE session_id = ?1")?;
        let rows = stmt.query_map(params![session_id.as_str()], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, blob))
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            let (id_str, blob) = row?;
            let id = Uuid::parse_str(&id_str).map_err(|e| {
                rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text)
            })?;
            candidates.push((id, bytes_to_embedding(&blob)));
        }
        Ok(rank(embedding, candidates, k))
    }

    fn delete(&self, id: RecordId) -> Result<bool, IndexError> {
        let conn = self.lock()?;
        let n = conn.execute("DELETE FROM vectors WHERE id = ?1", params![id.to_string()])?;
        Ok(n > 0)
    }

    fn contains(&self, id: RecordId) -> Result<bool, IndexError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vectors WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryVectorIndex
// ─────────────────────────────────────────────────────────────────────────────

/// Volatile index; queries take a shared read lock so they never wait on each
/// other, only on writers.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: RwLock<HashMap<RecordId, (SessionId, Vec<f32>)>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VectorIndex for InMemoryVectorIndex {
    fn upsert(
        &self,
        id: RecordId,
        session_id: &SessionId,
        embedding: &[f32],
    ) -> Result<(), IndexError> {
        let mut map = self.entries.write().map_err(|_| IndexError::Poisoned)?;
        check_dimensions(map.values().next().map(|(_, e)| e.len()), embedding)?;
        map.insert(id, (session_id.clone(), embedding.to_vec()));
        Ok(())
    }

    fn query(
        &self,
        session_id: &SessionId,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<(RecordId, f32)>, IndexError> {
        let map = self.entries.read().map_err(|_| IndexError::Poisoned)?;
        check_dimensions(map.values().next().map(|(_, e)| e.len()), embedding)?;
        let candidates = map
            .iter()
            .filter(|(_, (sid, _))| sid == session_id)
            .map(|(id, (_, emb))| (*id, emb.clone()));
        Ok(rank(embedding, candidates, k))
    }

    fn delete(&self, id: RecordId) -> Result<bool, IndexError> {
        let mut map = self.entries.write().map_err(|_| IndexError::Poisoned)?;
        Ok(map.remove(&id).is_some())
    }

    fn contains(&self, id: RecordId) -> Result<bool, IndexError> {
        let map = self.entries.read().map_err(|_| IndexError::Poisoned)?;
        Ok(map.contains_key(&id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
