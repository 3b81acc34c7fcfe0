//! SQLite connection shared by the ledger, the memory log and the Q&A store

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Low-level storage failure, wrapped by the typed errors of each store
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Thread-safe SQLite handle. Cloning shares the same connection.
#[derive(Clone)]
pub struct KnowledgeDb {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for KnowledgeDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeDb").finish_non_exhaustive()
    }
}

impl KnowledgeDb {
    /// Open (or create) the database file and initialize the schema
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("Failed to open SQLite database at {:?}", path.as_ref()))?;
        info!("Initializing assessor database at {:?}", path.as_ref());
        Self::init(conn)
    }

    /// In-memory database, used by tests and one-shot commands
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS priorities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                level TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS statuses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS employees (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                priority_id INTEGER NOT NULL,
                employee_id INTEGER NOT NULL,
                status_id INTEGER NOT NULL,
                FOREIGN KEY(priority_id) REFERENCES priorities(id),
                FOREIGN KEY(employee_id) REFERENCES employees(id),
                FOREIGN KEY(status_id) REFERENCES statuses(id)
            );
            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                description TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                station_id INTEGER NOT NULL,
                priority_id INTEGER NOT NULL,
                status_id INTEGER NOT NULL,
                FOREIGN KEY(priority_id) REFERENCES priorities(id),
                FOREIGN KEY(status_id) REFERENCES statuses(id)
            );
            CREATE TABLE IF NOT EXISTS memories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                data TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS qa_documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                question TEXT NOT NULL,
                answer TEXT NOT NULL,
                embedding TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_employee ON tasks(employee_id);
            CREATE INDEX IF NOT EXISTS idx_alerts_status ON alerts(status_id);
            CREATE INDEX IF NOT EXISTS idx_memories_session ON memories(session_id);",
        )
        .context("Failed to create schema")?;

        conn.execute_batch(
            "INSERT OR IGNORE INTO priorities (level) VALUES ('Alta'), ('Média'), ('Baixa');
             INSERT OR IGNORE INTO statuses (name) VALUES ('pendente'), ('andamento'), ('concluida');",
        )
        .context("Failed to seed lookup tables")?;

        debug!("Database schema initialized successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool
    pub async fn call<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Connection) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| {
                warn!("Database mutex was poisoned, recovering");
                poisoned.into_inner()
            });
            f(&conn)
        })
        .await
        .map_err(|e| E::from(DbError::Join(e)))?
    }
}
