//! Persistence layer: durable per-session snapshots
//!
//! The actor only needs `get`/`put` on opaque keys. `SqliteStore` is the
//! production backend and runs every call on `spawn_blocking`;
//! `MemoryStore` backs `--store memory` and tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use mdxai_protocol::SessionState;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("snapshot serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("blocking store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Key-value storage with read-your-writes durability.
///
/// A `put` that returns `Ok` must be visible to every later `get` for the
/// same key, including after a process restart.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;
}

/// Storage key of a session's state snapshot
pub fn state_key(session_id: &str) -> String {
    format!("session/{session_id}/state")
}

/// Restore a session snapshot, if one was ever written.
pub async fn load_state(
    store: &dyn DurableStore,
    session_id: &str,
) -> Result<Option<SessionState>, StoreError> {
    match store.get(&state_key(session_id)).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

pub async fn save_state(store: &dyn DurableStore, state: &SessionState) -> Result<(), StoreError> {
    let json = serde_json::to_string(state)?;
    store.put(&state_key(&state.id), json).await
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS session_snapshots (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
)";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let db_path = path.clone();

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            if let Some(dir) = db_path.parent() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
            let conn = Connection::open(&db_path)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA synchronous = NORMAL;",
            )?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;

        info!(
            component = "persistence",
            event = "store.opened",
            path = %path.display(),
            "SQLite session store opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<String>, StoreError> {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            let value = conn
                .query_row(
                    "SELECT value FROM session_snapshots WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await?
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            conn.execute(
                "INSERT INTO session_snapshots (key, value, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )?;
            debug!(
                component = "persistence",
                event = "store.put",
                key = %key,
                bytes = value.len(),
            );
            Ok(())
        })
        .await?
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store; durable only for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}
