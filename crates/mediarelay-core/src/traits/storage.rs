//! Durable storage for the dispatch queue snapshot.

use crate::error::Result;

pub trait SnapshotStorage: Send + Sync {
    /// Last written snapshot, or `None` if nothing was ever written.
    fn read(&self) -> Result<Option<Vec<u8>>>;

    /// Replace the stored snapshot.
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Where the snapshot lives, for log lines.
    fn location(&self) -> String;
}
