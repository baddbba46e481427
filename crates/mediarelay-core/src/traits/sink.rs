//! Next stage after aggregation.

use async_trait::async_trait;

use crate::error::BundleRejected;
use crate::types::Bundle;

/// Receives settled bundles. Accepting a bundle takes ownership of its
/// artifacts; a rejected bundle is returned so the caller can release them.
#[async_trait]
pub trait BundleSink: Send + Sync {
    async fn accept(&self, bundle: Bundle) -> Result<(), BundleRejected>;
}
