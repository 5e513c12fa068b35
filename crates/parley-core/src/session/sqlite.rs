use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use super::storage::{SessionRecord, SessionStorage, SessionSummary};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        user_name TEXT NOT NULL,
        history TEXT NOT NULL,
        turn_count INTEGER NOT NULL DEFAULT 0,
        token_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        last_active INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_last_active ON sessions(last_active);
    CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_name);";

/// Session storage in a SQLite database. Timestamps are stored as epoch milliseconds.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create the session database.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open session database {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock poisoned: {e}"))
    }
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        id: row.get(0)?,
        user: row.get(1)?,
        history: row.get(2)?,
        turn_count: row.get::<_, i64>(3)? as usize,
        token_count: row.get::<_, i64>(4)? as u64,
        created_at: from_millis(row.get(5)?)?,
        last_active: from_millis(row.get(6)?)?,
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<SessionSummary> {
    Ok(SessionSummary {
        id: row.get(0)?,
        user: row.get(1)?,
        turn_count: row.get::<_, i64>(2)? as usize,
        token_count: row.get::<_, i64>(3)? as u64,
        created_at: from_millis(row.get(4)?)?,
        last_active: from_millis(row.get(5)?)?,
    })
}

#[async_trait]
impl SessionStorage for SqliteStorage {
    async fn load(&self, id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(
                "SELECT id, user_name, history, turn_count, token_count, created_at, last_active
                 FROM sessions WHERE id = ?1",
                rusqlite::params![id],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    async fn save(&self, record: &SessionRecord) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO sessions
                (id, user_name, history, turn_count, token_count, created_at, last_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                history = excluded.history,
                turn_count = excluded.turn_count,
                token_count = excluded.token_count,
                last_active = excluded.last_active",
            rusqlite::params![
                record.id,
                record.user,
                record.history,
                record.turn_count as i64,
                record.token_count as i64,
                record.created_at.timestamp_millis(),
                record.last_active.timestamp_millis(),
            ],
        )
        .with_context(|| format!("Failed to save session {}", record.id))?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute("DELETE FROM sessions WHERE id = ?1", rusqlite::params![id])?;
        Ok(removed > 0)
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_name, turn_count, token_count, created_at, last_active
             FROM sessions ORDER BY last_active DESC",
        )?;
        let rows = stmt.query_map([], summary_from_row)?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?);
        }
        Ok(summaries)
    }

    async fn delete_idle(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM sessions WHERE last_active < ?1",
            rusqlite::params![cutoff.timestamp_millis()],
        )?;
        Ok(removed)
    }
}
