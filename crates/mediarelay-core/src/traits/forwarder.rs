//! Forwarder trait: transmits one unit to the destination.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Artifact, ItemRef};

/// Every failure is treated as retryable by the dispatch queue.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Send artifacts, captioned by `caption_source` when present.
    async fn send(&self, caption_source: Option<&ItemRef>, artifacts: &[Artifact]) -> Result<()>;

    /// Send a text-only payload.
    async fn send_text(&self, text: &str) -> Result<()>;
}
