//! Structured Log Store.
//!
//! The append-only, canonical record of every turn. Records are never
//! updated or deleted; the semantic index may lag behind or lose entries, but
//! anything acknowledged here survives a crash.
//!
//! # Storage layout
//!
//! | column     | type    | description                                        |
//! |------------|---------|----------------------------------------------------|
//! | seq        | INTEGER | commit sequence, monotonically increasing          |
//! | id         | TEXT    | UUID v4 record id, shared with the semantic index  |
//! | session_id | TEXT    | owning session                                     |
//! | role       | TEXT    | `user`, `assistant` or `event`                     |
//! | text       | TEXT    | utterance, stored verbatim                         |
//! | timestamp  | TEXT    | fixed-width RFC-3339 (nanoseconds, UTC)            |
//!
//! Each append runs in its own transaction on a WAL journal with
//! `synchronous = FULL`.

use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use kindred_types::{CompanionError, RecordId, Role, SessionId, Turn};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LogError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("corrupt log row: {0}")]
    Corrupt(String),
    #[error("log connection mutex poisoned")]
    Poisoned,
}

impl From<LogError> for CompanionError {
    fn from(e: LogError) -> Self {
        CompanionError::Persistence(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LoggedTurn
// ─────────────────────────────────────────────────────────────────────────────

/// A [`Turn`] as it sits in the log, with its record id and commit sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedTurn {
    pub id: RecordId,
    /// Pass the largest `seq` seen back to [`TurnLog::read_since`] as the
    /// next cursor.
    pub seq: u64,
    pub turn: Turn,
}

// ─────────────────────────────────────────────────────────────────────────────
// TurnLog trait
// ─────────────────────────────────────────────────────────────────────────────

/// Durable append-only turn storage.
pub trait TurnLog: Send + Sync {
    /// Durably append `turn` under a fresh record id.
    fn append(&self, turn: &Turn) -> Result<LoggedTurn, LogError>;

    /// Every turn of a session, oldest first (timestamp, then commit order).
    fn read_all(&self, session_id: &SessionId) -> Result<Vec<Turn>, LogError>;

    /// Records of a session committed after `cursor`, in commit order.
    fn read_since(&self, session_id: &SessionId, cursor: u64)
    -> Result<Vec<LoggedTurn>, LogError>;

    fn get(&self, id: RecordId) -> Result<Option<LoggedTurn>, LogError>;

    /// Distinct session ids that have at least one record.
    fn sessions(&self) -> Result<Vec<SessionId>, LogError>;

    fn count(&self, session_id: &SessionId) -> Result<usize, LogError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteTurnLog
// ─────────────────────────────────────────────────────────────────────────────

pub struct SqliteTurnLog {
    conn: Mutex<Connection>,
}

impl SqliteTurnLog {
    /// Open (or create) a persistent log at `path`.
    pub fn open(path: &str) -> Result<Self, LogError> {
        let conn = Connection::open(path)?;
        crate::configure_connection(&conn)?;
        Self::with_connection(conn)
    }

    /// Open a temporary in-memory log (useful for testing).
    pub fn open_in_memory() -> Result<Self, LogError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LogError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS turns (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                id         TEXT NOT NULL UNIQUE,
                session_id TEXT NOT NULL,
                role       TEXT NOT NULL,
                text       TEXT NOT NULL,
                timestamp  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS turns_session_ts
                ON turns (session_id, timestamp, seq);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LogError> {
        self.conn.lock().map_err(|_| LogError::Poisoned)
    }
}

/// Fixed-width encoding so lexical order in SQLite equals chronological order.
fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn corrupt(col: usize, msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(col, msg.into(), rusqlite::types::Type::Text)
}

fn row_to_logged(row: &Row<'_>) -> rusqlite::Result<LoggedTurn> {
    let seq: i64 = row.get(0)?;
    let id_str: String = row.get(1)?;
    let session_str: String = row.get(2)?;
    let role_str: String = row.get(3)?;
    let text: String = row.get(4)?;
    let ts_str: String = row.get(5)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| corrupt(1, e.to_string()))?;
    let session_id = SessionId::parse(session_str).map_err(|e| corrupt(2, e.to_string()))?;
    let role = Role::parse(&role_str).ok_or_else(|| corrupt(3, role_str.clone()))?;
    let timestamp = ts_str
        .parse::<DateTime<Utc>>()
        .map_err(|e| corrupt(5, e.to_string()))?;

    Ok(LoggedTurn {
        id,
        seq: seq as u64,
        turn: Turn {
            role,
            text,
            timestamp,
            session_id,
        },
    })
}

const SELECT_COLUMNS: &str = "SELECT seq, id, session_id, role, text, timestamp FROM turns";

impl TurnLog for SqliteTurnLog {
    fn append(&self, turn: &Turn) -> Result<LoggedTurn, LogError> {
        let id = Uuid::new_v4();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO turns (id, session_id, role, text, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                turn.session_id.as_str(),
                turn.role.as_str(),
                turn.text,
                encode_timestamp(&turn.timestamp),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;
        Ok(LoggedTurn {
            id,
            seq: seq as u64,
            turn: turn.clone(),
        })
    }

    fn read_all(&self, session_id: &SessionId) -> Result<Vec<Turn>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 ORDER BY timestamp ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(params![session_id.as_str()], row_to_logged)?;
        let mut turns = Vec::new();
        for row in rows {
            turns.push(row?.turn);
        }
        Ok(turns)
    }

    fn read_since(
        &self,
        session_id: &SessionId,
        cursor: u64,
    ) -> Result<Vec<LoggedTurn>, LogError> {
        let cursor = i64::try_from(cursor)
            .map_err(|_| LogError::Corrupt(format!("cursor {cursor} out of range")))?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![session_id.as_str(), cursor], row_to_logged)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LogError::from)
    }

    fn get(&self, id: RecordId) -> Result<Option<LoggedTurn>, LogError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                params![id.to_string()],
                row_to_logged,
            )
            .optional()?;
        Ok(found)
    }

    fn sessions(&self) -> Result<Vec<SessionId>, LogError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT session_id FROM turns ORDER BY session_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            let raw = raw?;
            let id = SessionId::parse(raw).map_err(|e| LogError::Corrupt(e.to_string()))?;
            out.push(id);
        }
        Ok(out)
    }

    fn count(&self, session_id: &SessionId) -> Result<usize, LogError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM turns WHERE session_id = ?1",
            params![session_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
