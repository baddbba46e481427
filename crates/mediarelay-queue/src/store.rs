//! Queue snapshot format and file-based snapshot storage.
//! Snapshot saved as one JSON document that is easy to inspect by hand.
//! Only written on queue mutations, never on idle ticks.

use chrono::{DateTime, Utc};
use mediarelay_core::{RelayError, Result, SnapshotStorage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::item::QueuedItem;

/// Cumulative counters, persisted with the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    #[serde(default)]
    pub total_queued: u64,
    #[serde(default)]
    pub total_sent: u64,
    #[serde(default)]
    pub total_failed: u64,
}

/// Everything needed to rebuild the queue after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    #[serde(default)]
    pub queue: Vec<QueuedItem>,
    #[serde(default)]
    pub stats: QueueStats,
    pub saved_at: DateTime<Utc>,
}

impl QueueSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// File-based snapshot storage.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    /// Store the snapshot at `path`, creating parent directories.
    pub fn new(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Self {
            path: path.to_path_buf(),
        }
    }
}

impl SnapshotStorage for FileStorage {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        if !self.path.exists() {
            return Ok(None);
        }
        std::fs::read(&self.path)
            .map(Some)
            .map_err(|e| RelayError::Persistence(format!("Read {}: {e}", self.path.display())))
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        // Write-then-rename so a crash never leaves a truncated snapshot.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .map_err(|e| RelayError::Persistence(format!("Write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| RelayError::Persistence(format!("Rename {}: {e}", self.path.display())))?;
        tracing::debug!("💾 Saved queue snapshot to {}", self.path.display());
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory snapshot storage, for embedding and tests.
#[derive(Default)]
pub struct MemoryStorage {
    bytes: Mutex<Option<Vec<u8>>>,
    writes: Mutex<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or_default()
    }
}

impl SnapshotStorage for MemoryStorage {
    fn read(&self) -> Result<Option<Vec<u8>>> {
        self.bytes
            .lock()
            .map(|b| b.clone())
            .map_err(|e| RelayError::Persistence(format!("Lock poisoned: {e}")))
    }

    fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut slot = self
            .bytes
            .lock()
            .map_err(|e| RelayError::Persistence(format!("Lock poisoned: {e}")))?;
        *slot = Some(bytes.to_vec());
        if let Ok(mut w) = self.writes.lock() {
            *w += 1;
        }
        Ok(())
    }

    fn location(&self) -> String {
        "memory".into()
    }
}
