//! Error taxonomy for the relay pipeline.
//!
//! Collaborator failures are absorbed by the component that sees them and
//! turned into a state transition plus a log line; these variants are what
//! travels between components and up to the binary.

use thiserror::Error;

use crate::types::Bundle;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Queue full ({capacity} items)")]
    QueueFull { capacity: usize },

    #[error("Bundle has no artifacts and no text")]
    EmptyBundle,

    #[error("Item {0} is already queued")]
    DuplicateItem(i64),

    #[error("Dispatch failed (retryable): {0}")]
    TransientDispatch(String),

    #[error("Dispatch failed permanently after {retries} retries: {reason}")]
    PermanentDispatch { retries: u32, reason: String },

    #[error("Group {key} download timed out after {elapsed_secs}s")]
    GroupDownloadTimeout { key: String, elapsed_secs: u64 },

    #[error("Proxy unreachable: {0}")]
    ProxyUnreachable(String),

    #[error("No reachable proxy in pool")]
    NoReachableProxy,

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Download error: {0}")]
    Download(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// A bundle handed back by a sink that refused it. Artifact ownership returns
/// with it: the caller must release them.
#[derive(Debug, Error)]
#[error("{reason}")]
pub struct BundleRejected {
    pub reason: RelayError,
    pub bundle: Bundle,
}
