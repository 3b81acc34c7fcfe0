//! Long-term session memory log
//!
//! Append-only list of timestamped records per session. The curator agent
//! is the only writer; the dispatcher reads the full list before routing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::sqlite::{DbError, KnowledgeDb};

/// One remembered fact, preference or decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub timestamp: DateTime<Utc>,
    pub data: JsonValue,
}

impl std::fmt::Display for MemoryRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            JsonValue::String(s) => write!(f, "[{}] {}", self.timestamp.to_rfc3339(), s),
            other => write!(f, "[{}] {}", self.timestamp.to_rfc3339(), other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryStoreError {
    /// The backing store could not be reached. Distinct from an empty log.
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
}

impl From<DbError> for MemoryStoreError {
    fn from(e: DbError) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for MemoryStoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

/// Storage contract for the per-session memory log
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Append a record stamped with the current UTC time
    async fn append(&self, session_id: &str, content: JsonValue) -> Result<MemoryRecord, MemoryStoreError>;

    /// Remove and return the newest record, `None` when the log is empty
    async fn pop_last(&self, session_id: &str) -> Result<Option<MemoryRecord>, MemoryStoreError>;

    /// Every record in insertion order. Unknown sessions yield an empty list.
    async fn list_all(&self, session_id: &str) -> Result<Vec<MemoryRecord>, MemoryStoreError>;
}

/// SQLite-backed memory log
#[derive(Debug, Clone)]
pub struct SqliteMemoryStore {
    db: KnowledgeDb,
}

impl SqliteMemoryStore {
    pub fn new(db: KnowledgeDb) -> Self {
        Self { db }
    }
}

fn decode(timestamp: String, data: String) -> MemoryRecord {
    let timestamp = timestamp.parse().unwrap_or_else(|_| Utc::now());
    // Records written by other tools may hold plain text instead of JSON
    let data = serde_json::from_str(&data).unwrap_or_else(|_| {
        warn!("Memory record is not valid JSON, keeping raw text");
        JsonValue::String(data)
    });
    MemoryRecord { timestamp, data }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn append(&self, session_id: &str, content: JsonValue) -> Result<MemoryRecord, MemoryStoreError> {
        let session_id = session_id.to_owned();
        self.db
            .call(move |conn| {
                let record = MemoryRecord {
                    timestamp: Utc::now(),
                    data: content,
                };
                let data = serde_json::to_string(&record.data).map_err(DbError::from)?;
                conn.execute(
                    "INSERT INTO memories (session_id, timestamp, data) VALUES (?1, ?2, ?3)",
                    params![&session_id, record.timestamp.to_rfc3339(), data],
                )?;
                debug!("Recorded memory for session {}", session_id);
                Ok(record)
            })
            .await
    }

    async fn pop_last(&self, session_id: &str) -> Result<Option<MemoryRecord>, MemoryStoreError> {
        let session_id = session_id.to_owned();
        self.db
            .call(move |conn| {
                let last = conn
                    .query_row(
                        "SELECT id, timestamp, data FROM memories
                         WHERE session_id = ?1 ORDER BY id DESC LIMIT 1",
                        params![&session_id],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
                    )
                    .optional()?;

                match last {
                    Some((id, timestamp, data)) => {
                        conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
                        debug!("Removed last memory {} of session {}", id, session_id);
                        Ok(Some(decode(timestamp, data)))
                    }
                    None => Ok(None),
                }
            })
            .await
    }

    async fn list_all(&self, session_id: &str) -> Result<Vec<MemoryRecord>, MemoryStoreError> {
        let session_id = session_id.to_owned();
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT timestamp, data FROM memories WHERE session_id = ?1 ORDER BY id ASC",
                )?;
                let rows = stmt
                    .query_map(params![&session_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows.into_iter().map(|(ts, data)| decode(ts, data)).collect())
            })
            .await
    }
}
