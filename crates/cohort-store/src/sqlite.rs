//! SQLite implementation of the StateStore trait.
//!
//! This is the primary snapshot backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use cohort_core::GroupId;

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::StateStore;

/// SQLite-based snapshot store.
///
/// Thread-safe via internal Mutex. All trait operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStateStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// When the snapshot of `group` was last saved (Unix ms).
    pub fn saved_at(&self, group: &GroupId) -> Result<Option<i64>> {
        let conn = lock(&self.conn)?;
        let saved_at = conn
            .query_row(
                "SELECT saved_at FROM group_states WHERE group_id = ?1",
                params![group.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(saved_at)
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Worker(e.to_string()))?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            Some(format!("mutex poisoned: {}", e)),
        ))
    })
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, group: &GroupId, file: &Path) -> Result<bool> {
        let group = group.clone();
        let file: PathBuf = file.to_path_buf();

        self.blocking(move |conn| {
            let state: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT state FROM group_states WHERE group_id = ?1",
                    params![group.as_str()],
                    |row| row.get(0),
                )
                .optional()?;

            match state {
                Some(state) => {
                    std::fs::write(&file, &state)?;
                    tracing::debug!(group = %group, size = state.len(), "loaded group state");
                    Ok(true)
                }
                None => Ok(false),
            }
        })
        .await
    }

    async fn save(&self, group: &GroupId, file: &Path) -> Result<()> {
        let group = group.clone();
        let file: PathBuf = file.to_path_buf();

        self.blocking(move |conn| {
            let state = std::fs::read(&file)?;
            conn.execute(
                "INSERT INTO group_states (group_id, state, size, saved_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(group_id) DO UPDATE SET
                    state = excluded.state,
                    size = excluded.size,
                    saved_at = excluded.saved_at",
                params![group.as_str(), state, state.len() as i64, now_millis()],
            )?;
            tracing::debug!(group = %group, size = state.len(), "saved group state");
            Ok(())
        })
        .await
    }
}
