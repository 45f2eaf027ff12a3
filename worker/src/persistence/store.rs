//! Stats storage backends.
//!
//! [`StatsBackend`] is synchronous; callers run it on the blocking pool. The
//! SQLite backend opens a fresh connection per call so no connection is ever
//! shared across threads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{DatabaseOperation, OperationKind};

// ============================================================================
// Data Types
// ============================================================================

/// One recorded installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallEvent {
    pub id: i64,
    pub name: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub name: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Everything one transaction writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitBatch {
    /// Summed deltas per stat key, in first-seen order.
    pub stat_increments: Vec<(String, i64)>,
    pub events: Vec<NewEvent>,
}

impl CommitBatch {
    pub fn from_operations(operations: &[DatabaseOperation]) -> Self {
        let mut batch = CommitBatch::default();
        let mut positions: HashMap<&str, usize> = HashMap::new();

        for op in operations {
            match &op.kind {
                OperationKind::IncrementStat => match positions.get(op.key.as_str()) {
                    Some(&index) => batch.stat_increments[index].1 += 1,
                    None => {
                        positions.insert(op.key.as_str(), batch.stat_increments.len());
                        batch.stat_increments.push((op.key.clone(), 1));
                    }
                },
                OperationKind::RecordEvent { payload } => batch.events.push(NewEvent {
                    name: op.key.clone(),
                    payload: payload.clone(),
                    timestamp: op.timestamp,
                }),
            }
        }
        batch
    }

    pub fn stat_keys(&self) -> impl Iterator<Item = &str> {
        self.stat_increments.iter().map(|(key, _)| key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.stat_increments.is_empty() && self.events.is_empty()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid timestamp format: {0}")]
    InvalidTimestamp(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

// ============================================================================
// Backend
// ============================================================================

pub trait StatsBackend: Send + Sync + 'static {
    /// Create tables and indexes. Safe to call repeatedly.
    fn initialize(&self) -> Result<(), StoreError>;

    /// Apply a whole batch atomically.
    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError>;

    /// Current value of a stat; 0 when the key was never written.
    fn get_count(&self, key: &str) -> Result<i64, StoreError>;

    /// Newest events first.
    fn recent_events(&self, limit: usize) -> Result<Vec<InstallEvent>, StoreError>;
}

pub struct SqliteStatsStore {
    path: PathBuf,
}

impl SqliteStatsStore {
    const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Self::BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

impl StatsBackend for SqliteStatsStore {
    fn initialize(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = self.open()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS stats (
                key TEXT PRIMARY KEY,
                count INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS install_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{}',
                timestamp TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_stats_key ON stats(key);
            CREATE INDEX IF NOT EXISTS idx_install_events_timestamp
                ON install_events(timestamp DESC);
            "#,
        )?;
        Ok(())
    }

    fn commit(&self, batch: &CommitBatch) -> Result<(), StoreError> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;

        for (key, delta) in &batch.stat_increments {
            let current: i64 = tx
                .query_row("SELECT count FROM stats WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?
                .unwrap_or(0);
            tx.execute(
                "INSERT INTO stats (key, count) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET count = excluded.count",
                params![key, current + delta],
            )?;
        }

        for event in &batch.events {
            tx.execute(
                "INSERT INTO install_events (name, payload, timestamp) VALUES (?1, ?2, ?3)",
                params![
                    event.name,
                    serde_json::to_string(&event.payload)?,
                    event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn get_count(&self, key: &str) -> Result<i64, StoreError> {
        let conn = self.open()?;
        let count = conn
            .query_row("SELECT count FROM stats WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    fn recent_events(&self, limit: usize) -> Result<Vec<InstallEvent>, StoreError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, payload, timestamp FROM install_events
             ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, name, payload, timestamp) = row?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|_| StoreError::InvalidTimestamp(timestamp.clone()))?
                .with_timezone(&Utc);
            events.push(InstallEvent {
                id,
                name,
                payload: serde_json::from_str(&payload)?,
                timestamp,
            });
        }
        Ok(events)
    }
}
