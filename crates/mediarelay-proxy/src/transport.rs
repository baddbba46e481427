//! Transport construction from the pool's current egress selection.

use mediarelay_core::{RelayError, Result};
use std::time::Duration;

use crate::endpoint::EgressConfig;

/// Builds the connection object the forwarder talks through.
/// `None` means connect directly.
pub trait TransportFactory: Send + Sync {
    type Transport;

    fn build(&self, egress: Option<&EgressConfig>) -> Result<Self::Transport>;
}

/// Produces `reqwest::Client`s routed through the selected proxy.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl TransportFactory for HttpTransportFactory {
    type Transport = reqwest::Client;

    fn build(&self, egress: Option<&EgressConfig>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder().timeout(self.timeout);
        match egress {
            Some(egress) => {
                tracing::debug!("🌐 Transport via {}://{}:{}", egress.kind, egress.addr, egress.port);
                builder = builder.proxy(egress.to_reqwest_proxy()?);
            }
            // Ignore proxy environment variables too.
            None => builder = builder.no_proxy(),
        }
        builder
            .build()
            .map_err(|e| RelayError::Config(format!("Failed to build HTTP client: {e}")))
    }
}
