//! Outbound side of the relay: a webhook forwarder routed through the proxy
//! pool, and a sink that forwards bundles straight away when the dispatch
//! queue is disabled.

use async_trait::async_trait;
use mediarelay_core::config::ForwardConfig;
use mediarelay_core::{
    Artifact, Bundle, BundleRejected, BundleSink, Forwarder, ItemRef, RelayError, Result,
};
use mediarelay_proxy::{HttpTransportFactory, ProxyPool, TransportFactory};
use std::sync::Arc;
use std::time::Duration;

/// POSTs a JSON descriptor of each unit to a webhook.
pub struct WebhookForwarder {
    url: String,
    pool: Arc<ProxyPool>,
    transport: HttpTransportFactory,
}

impl WebhookForwarder {
    pub fn new(config: &ForwardConfig, pool: Arc<ProxyPool>) -> Self {
        Self {
            url: config.webhook_url.clone(),
            pool,
            transport: HttpTransportFactory::new(Duration::from_secs(config.timeout_secs)),
        }
    }

    async fn post(&self, body: serde_json::Value) -> Result<()> {
        let egress = self.pool.get_current_config().await;
        let client = self.transport.build(egress.as_ref())?;
        let resp = client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::TransientDispatch(format!("Webhook request failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::TransientDispatch(format!("Webhook returned {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Forwarder for WebhookForwarder {
    async fn send(&self, caption_source: Option<&ItemRef>, artifacts: &[Artifact]) -> Result<()> {
        self.post(serde_json::json!({
            "kind": "media",
            "caption": caption_source.map(|c| c.text.as_str()).unwrap_or(""),
            "caption_id": caption_source.map(|c| c.id),
            "files": artifacts,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .await?;
        tracing::info!("📤 Forwarded {} artifacts", artifacts.len());
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.post(serde_json::json!({
            "kind": "text",
            "caption": text,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .await?;
        tracing::info!("📤 Forwarded text message");
        Ok(())
    }
}

/// Forwards each bundle as soon as it settles. No delay, no retry.
pub struct DirectSink {
    forwarder: Arc<dyn Forwarder>,
}

impl DirectSink {
    pub fn new(forwarder: Arc<dyn Forwarder>) -> Self {
        Self { forwarder }
    }
}

#[async_trait]
impl BundleSink for DirectSink {
    async fn accept(&self, bundle: Bundle) -> std::result::Result<(), BundleRejected> {
        let result = if bundle.artifacts.is_empty() {
            self.forwarder.send_text(bundle.caption()).await
        } else {
            self.forwarder
                .send(bundle.caption_source.as_ref(), &bundle.artifacts)
                .await
        };
        match result {
            Ok(()) => {
                bundle.release().await;
                Ok(())
            }
            Err(reason) => Err(BundleRejected { reason, bundle }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediarelay_core::InboundItem;
    use mediarelay_proxy::TunnelProbe;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accepts one request, replies with `status`, returns the raw request.
    async fn one_shot_server(status: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw);
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let len = head
                        .lines()
                        .filter_map(|l| l.split_once(':'))
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if body.len() >= len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let reply = format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            stream.write_all(reply.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).into_owned()
        });
        (url, handle)
    }

    fn forwarder(url: &str) -> WebhookForwarder {
        let probe = Arc::new(TunnelProbe::new("149.154.167.50", 443, Duration::from_secs(1)));
        let pool = Arc::new(ProxyPool::new(Vec::new(), probe, false, Duration::from_secs(3600)));
        let config = ForwardConfig {
            webhook_url: url.to_string(),
            timeout_secs: 5,
        };
        WebhookForwarder::new(&config, pool)
    }

    #[tokio::test]
    async fn test_send_posts_descriptor() {
        let (url, server) = one_shot_server("200 OK").await;
        let caption = ItemRef { id: 5, text: "look".into() };
        let artifacts = vec![Artifact::new("/tmp/a.jpg", mediarelay_core::MediaKind::Photo, 3)];

        forwarder(&url).send(Some(&caption), &artifacts).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("\"caption\":\"look\""));
        assert!(request.contains("\"caption_id\":5"));
        assert!(request.contains("/tmp/a.jpg"));
    }

    #[tokio::test]
    async fn test_error_status_is_transient() {
        let (url, server) = one_shot_server("503 Service Unavailable").await;
        let err = forwarder(&url).send_text("hi").await.unwrap_err();
        assert!(matches!(err, RelayError::TransientDispatch(_)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_sink_releases_on_success() {
        let (url, server) = one_shot_server("200 OK").await;
        let dir = std::env::temp_dir().join(format!("mediarelay-direct-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("clip.mp4");
        std::fs::write(&path, b"v").unwrap();

        let sink = DirectSink::new(Arc::new(forwarder(&url)));
        let item = InboundItem::new(1, "caption");
        let bundle = Bundle::singleton(
            &item,
            vec![Artifact::new(&path, mediarelay_core::MediaKind::Video, 1)],
            chrono::Utc::now(),
        );
        sink.accept(bundle).await.unwrap();
        server.await.unwrap();
        assert!(!path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
