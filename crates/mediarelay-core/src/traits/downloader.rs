//! Downloader trait: retrieves raw content for one inbound item.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Artifact, InboundItem};

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Stage every media artifact of `item` locally.
    /// An `Err` just omits this item's artifacts from the bundle.
    async fn fetch(&self, item: &InboundItem) -> Result<Vec<Artifact>>;
}
