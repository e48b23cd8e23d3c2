use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, warn};

use revloop_core::error::{Result, RevloopError};
use revloop_core::review::ReviewSession;
use revloop_core::traits::ReviewStore;
use revloop_core::types::SessionId;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS review_sessions (
         session_id TEXT PRIMARY KEY,
         input TEXT NOT NULL,
         candidate TEXT NOT NULL,
         feedback_json TEXT NOT NULL,
         attempt INTEGER NOT NULL,
         decision TEXT NOT NULL,
         status TEXT NOT NULL,
         created_at TEXT NOT NULL,
         updated_at TEXT NOT NULL,
         version INTEGER NOT NULL DEFAULT 0
     );

     CREATE INDEX IF NOT EXISTS idx_review_updated
         ON review_sessions(updated_at DESC);";

const COLUMNS: &str = "session_id, input, candidate, feedback_json, attempt, decision, status, \
                       created_at, updated_at, version";

/// Durable review store backed by SQLite, so a session suspended in one
/// process can be resumed by another.
pub struct SqliteReviewStore {
    conn: Mutex<Connection>,
}

impl SqliteReviewStore {
    /// Open or create the review database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RevloopError::Database(format!("Failed to create review db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| RevloopError::Database(format!("Failed to open review store: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(|e| {
            RevloopError::Database(format!("Failed to initialize review schema: {}", e))
        })?;
        migrate_version_column(&conn)?;

        debug!(path = %path.display(), "Review store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RevloopError::Database(e.to_string()))
    }

    /// Insert, or update only if the stored row is the session's predecessor.
    /// Another process that saved first leaves the row untouched here.
    fn save_sync(&self, s: &ReviewSession) -> Result<()> {
        let feedback_json = serde_json::to_string(&s.feedback)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "INSERT INTO review_sessions (session_id, input, candidate, feedback_json, attempt, decision, status, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(session_id) DO UPDATE SET
                 candidate = excluded.candidate,
                 feedback_json = excluded.feedback_json,
                 attempt = excluded.attempt,
                 decision = excluded.decision,
                 status = excluded.status,
                 updated_at = excluded.updated_at,
                 version = excluded.version
             WHERE review_sessions.version = excluded.version - 1",
            params![
                s.session_id.as_str(),
                s.input,
                s.candidate,
                feedback_json,
                s.attempt as i64,
                s.decision.as_str(),
                s.status.as_str(),
                s.created_at.to_rfc3339(),
                s.updated_at.to_rfc3339(),
                s.version as i64,
            ],
        )
        .map_err(|e| RevloopError::Database(format!("Failed to save review session: {}", e)))?;
        if changed == 0 {
            warn!(session_id = %s.session_id, version = s.version, "Stale review session save refused");
            return Err(RevloopError::SessionConflict(s.session_id.to_string()));
        }
        Ok(())
    }

    fn load_sync(&self, session_id: &SessionId) -> Result<Option<ReviewSession>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {} FROM review_sessions WHERE session_id = ?1", COLUMNS),
                params![session_id.as_str()],
                RawSession::from_row,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(RawSession::into_session).transpose()
    }

    fn delete_sync(&self, session_id: &SessionId) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM review_sessions WHERE session_id = ?1",
                params![session_id.as_str()],
            )
            .map_err(db_err)?;
        Ok(deleted > 0)
    }

    fn list_sync(&self) -> Result<Vec<ReviewSession>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM review_sessions ORDER BY updated_at DESC",
                COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt.query_map([], RawSession::from_row).map_err(db_err)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw.map_err(db_err)?.into_session()?);
        }
        Ok(out)
    }
}

/// Column values as stored, before enum and timestamp parsing.
struct RawSession {
    session_id: String,
    input: String,
    candidate: String,
    feedback_json: String,
    attempt: i64,
    decision: String,
    status: String,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            input: row.get(1)?,
            candidate: row.get(2)?,
            feedback_json: row.get(3)?,
            attempt: row.get(4)?,
            decision: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            version: row.get(9)?,
        })
    }

    fn into_session(self) -> Result<ReviewSession> {
        Ok(ReviewSession {
            session_id: SessionId(self.session_id),
            input: self.input,
            candidate: self.candidate,
            feedback: serde_json::from_str(&self.feedback_json)?,
            attempt: self.attempt as u32,
            decision: self.decision.parse()?,
            status: self.status.parse()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            version: self.version as u64,
        })
    }
}

/// Databases created before sessions were versioned lack the column.
fn migrate_version_column(conn: &Connection) -> Result<()> {
    let has_version = conn
        .prepare("SELECT 1 FROM pragma_table_info('review_sessions') WHERE name = 'version'")
        .and_then(|mut stmt| stmt.exists([]))
        .map_err(db_err)?;
    if !has_version {
        debug!("Adding version column to review_sessions");
        conn.execute_batch(
            "ALTER TABLE review_sessions ADD COLUMN version INTEGER NOT NULL DEFAULT 0",
        )
        .map_err(db_err)?;
    }
    Ok(())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RevloopError::Database(format!("Bad timestamp '{}': {}", s, e)))
}

fn db_err(e: rusqlite::Error) -> RevloopError {
    RevloopError::Database(e.to_string())
}

impl ReviewStore for SqliteReviewStore {
    fn save<'a>(&'a self, session: &'a ReviewSession) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.save_sync(session) })
    }

    fn load<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<Option<ReviewSession>>> {
        Box::pin(async move { self.load_sync(session_id) })
    }

    fn delete<'a>(&'a self, session_id: &'a SessionId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.delete_sync(session_id) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ReviewSession>>> {
        Box::pin(async move { self.list_sync() })
    }
}
