//! Durable affect snapshots.
//!
//! Optional companion to the turn log: when enabled, every affect update is
//! appended here so a session reopened after a restart resumes from its last
//! mood/trust/energy instead of the persona baseline.

use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use kindred_types::{AffectSnapshot, AffectVector, SessionId};
use rusqlite::{Connection, OptionalExtension, params};

use crate::log_store::LogError;

pub struct AffectLog {
    conn: Mutex<Connection>,
}

impl AffectLog {
    pub fn open(path: &str) -> Result<Self, LogError> {
        let conn = Connection::open(path)?;
        crate::configure_connection(&conn)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, LogError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, LogError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS affect_snapshots (
                seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                mood       REAL NOT NULL,
                trust      REAL NOT NULL,
                energy     REAL NOT NULL,
                timestamp  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS affect_session ON affect_snapshots (session_id, seq);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LogError> {
        self.conn.lock().map_err(|_| LogError::Poisoned)
    }

    pub fn record(&self, session_id: &SessionId, snapshot: &AffectSnapshot) -> Result<(), LogError> {
        let a = snapshot.affect;
        self.lock()?.execute(
            "INSERT INTO affect_snapshots (session_id, mood, trust, energy, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id.as_str(),
                f64::from(a.mood),
                f64::from(a.trust),
                f64::from(a.energy),
                snapshot.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )?;
        Ok(())
    }

    /// Most recent snapshot for `session_id`, if any.
    pub fn latest(&self, session_id: &SessionId) -> Result<Option<AffectSnapshot>, LogError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT mood, trust, energy, timestamp FROM affect_snapshots
                 WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![session_id.as_str()],
                row_to_snapshot,
            )
            .optional()?;
        Ok(row)
    }

    /// Up to `limit` most recent snapshots, oldest first.
    pub fn history(&self, session_id: &SessionId, limit: usize) -> Result<Vec<AffectSnapshot>, LogError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT mood, trust, energy, timestamp FROM affect_snapshots
             WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut out = stmt
            .query_map(params![session_id.as_str(), limit], row_to_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;
        out.reverse();
        Ok(out)
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<AffectSnapshot> {
    let mood: f64 = row.get(0)?;
    let trust: f64 = row.get(1)?;
    let energy: f64 = row.get(2)?;
    let ts: String = row.get(3)?;
    let timestamp = ts.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(3, e.to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(AffectSnapshot {
        affect: AffectVector::new(mood as f32, trust as f32, energy as f32),
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test]
    fn latest_returns_most_recent_snapshot() {
        let log = AffectLog::open_in_memory().unwrap();
        let s = sid("u1");
        assert!(log.latest(&s).unwrap().is_none());

        log.record(&s, &AffectSnapshot::now(AffectVector::new(0.6, 0.5, 0.5))).unwrap();
        log.record(&s, &AffectSnapshot::now(AffectVector::new(0.3, 0.45, 0.52))).unwrap();
        log.record(&sid("other"), &AffectSnapshot::now(AffectVector::new(0.9, 0.9, 0.9)))
            .unwrap();

        let latest = log.latest(&s).unwrap().unwrap();
        assert!((latest.affect.mood - 0.3).abs() < 1e-6);
        assert!((latest.affect.trust - 0.45).abs() < 1e-6);
    }

    #[test]
    fn history_is_bounded_and_oldest_first() {
        let log = AffectLog::open_in_memory().unwrap();
        let s = sid("u1");
        for i in 0..5 {
            let m = i as f32 / 10.0;
            log.record(&s, &AffectSnapshot::now(AffectVector::new(m, 0.5, 0.5))).unwrap();
        }
        let moods: Vec<f32> = log
            .history(&s, 3)
            .unwrap()
            .iter()
            .map(|snap| snap.affect.mood)
            .collect();
        assert_eq!(moods.len(), 3);
        assert!((moods[0] - 0.2).abs() < 1e-6);
        assert!((moods[2] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn snapshots_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("affect.db");
        let path = path.to_str().unwrap();
        {
            let log = AffectLog::open(path).unwrap();
            log.record(&sid("u1"), &AffectSnapshot::now(AffectVector::new(0.7, 0.55, 0.4)))
                .unwrap();
        }
        let log = AffectLog::open(path).unwrap();
        let latest = log.latest(&sid("u1")).unwrap().unwrap();
        assert!((latest.affect.energy - 0.4).abs() < 1e-6);
    }
}
