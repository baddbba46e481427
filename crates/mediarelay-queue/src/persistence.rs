//! SQLite-backed snapshot storage.
//! Alternative to the JSON file store for hosts that already keep state in
//! SQLite; survives restarts and tolerates concurrent readers.

use chrono::Utc;
use mediarelay_core::{RelayError, Result, SnapshotStorage};
use std::path::Path;
use std::sync::Mutex;

/// SQLite-backed queue snapshot store. Holds exactly one row.
pub struct SqliteStorage {
    conn: Mutex<rusqlite::Connection>,
    location: String,
}

impl SqliteStorage {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| RelayError::Persistence(format!("DB open: {e}")))?;
        let db = Self {
            conn: Mutex::new(conn),
            location: path.display().to_string(),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_snapshot (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body BLOB NOT NULL,          -- JSON QueueSnapshot
                saved_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| RelayError::Persistence(format!("Migration: {e}")))?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Persistence(format!("Lock poisoned: {e}")))
    }
}

impl SnapshotStorage for SqliteStorage {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT body FROM queue_snapshot WHERE id = 1")
            .map_err(|e| RelayError::Persistence(format!("Prepare: {e}")))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| RelayError::Persistence(format!("Query: {e}")))?;
        match rows
            .next()
            .map_err(|e| RelayError::Persistence(format!("Row: {e}")))?
        {
            Some(row) => {
                let body: Vec<u8> = row
                    .get(0)
                    .map_err(|e| RelayError::Persistence(format!("Column: {e}")))?;
                Ok(Some(body))
            }
            None => Ok(None),
        }
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO queue_snapshot (id, body, saved_at) VALUES (1, ?1, ?2)",
            rusqlite::params![bytes, Utc::now().to_rfc3339()],
        )
        .map_err(|e| RelayError::Persistence(format!("Save snapshot: {e}")))?;
        tracing::debug!("💾 Saved queue snapshot to {}", self.location);
        Ok(())
    }

    fn location(&self) -> String {
        format!("sqlite:{}", self.location)
    }
}
