//! Reachability probe: open a tunnel through a candidate proxy to a fixed
//! target and report whether the proxy granted it, within a bounded timeout.

use async_trait::async_trait;
use base64::Engine;
use mediarelay_core::{ProxyKind, RelayError, Result};
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::endpoint::ProxyEndpoint;
use crate::transport::{HttpTransportFactory, TransportFactory};

/// Cap on an HTTP CONNECT response header.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

#[async_trait]
pub trait Prober: Send + Sync {
    /// Whether `endpoint` can currently carry traffic.
    async fn probe(&self, endpoint: &ProxyEndpoint) -> bool;
}

/// Probes by tunnelling a TCP connection to `target` through the proxy.
pub struct TunnelProbe {
    target_host: String,
    target_port: u16,
    timeout: Duration,
}

impl TunnelProbe {
    pub fn new(target_host: &str, target_port: u16, timeout: Duration) -> Self {
        Self {
            target_host: target_host.to_string(),
            target_port,
            timeout,
        }
    }

    /// Build from a `host:port` target string.
    pub fn from_target(target: &str, timeout: Duration) -> Result<Self> {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| RelayError::Config(format!("Probe target '{target}' is not host:port")))?;
        let port = port
            .parse()
            .map_err(|_| RelayError::Config(format!("Probe target '{target}' has a bad port")))?;
        Ok(Self::new(host, port, timeout))
    }

    async fn tunnel(&self, ep: &ProxyEndpoint) -> Result<()> {
        let mut stream = TcpStream::connect((ep.host.as_str(), ep.port)).await?;
        match ep.kind {
            ProxyKind::Socks5 => self.socks5(&mut stream, ep).await,
            ProxyKind::Socks4 => self.socks4(&mut stream, ep).await,
            ProxyKind::Http => self.http_connect(&mut stream, ep).await,
        }
    }

    async fn socks5(&self, stream: &mut TcpStream, ep: &ProxyEndpoint) -> Result<()> {
        let creds = ep.credentials();
        let greeting: &[u8] = if creds.is_some() {
            &[0x05, 0x02, 0x00, 0x02]
        } else {
            &[0x05, 0x01, 0x00]
        };
        stream.write_all(greeting).await?;
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        match (choice[1], creds) {
            (0x00, _) => {}
            (0x02, Some((user, pass))) => {
                let (Ok(user_len), Ok(pass_len)) =
                    (u8::try_from(user.len()), u8::try_from(pass.len()))
                else {
                    return Err(refused(ep, "credential too long"));
                };
                let mut auth = vec![0x01, user_len];
                auth.extend_from_slice(user.as_bytes());
                auth.push(pass_len);
                auth.extend_from_slice(pass.as_bytes());
                stream.write_all(&auth).await?;
                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != 0x00 {
                    return Err(refused(ep, "authentication rejected"));
                }
            }
            _ => return Err(refused(ep, "no acceptable auth method")),
        }

        let mut request = vec![0x05, 0x01, 0x00];
        match self.target_host.parse::<Ipv4Addr>() {
            Ok(ip) => {
                request.push(0x01);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                let Ok(host_len) = u8::try_from(self.target_host.len()) else {
                    return Err(refused(ep, "probe target too long"));
                };
                request.push(0x03);
                request.push(host_len);
                request.extend_from_slice(self.target_host.as_bytes());
            }
        }
        request.extend_from_slice(&self.target_port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x00 {
            return Err(refused(ep, &format!("CONNECT refused (code {})", reply[1])));
        }
        Ok(())
    }

    async fn socks4(&self, stream: &mut TcpStream, ep: &ProxyEndpoint) -> Result<()> {
        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&self.target_port.to_be_bytes());
        let ip = self.target_host.parse::<Ipv4Addr>().ok();
        // SOCKS4a: 0.0.0.x plus a trailing hostname when the target is a name.
        request.extend_from_slice(&ip.unwrap_or(Ipv4Addr::new(0, 0, 0, 1)).octets());
        if let Some((user, _)) = ep.credentials() {
            request.extend_from_slice(user.as_bytes());
        }
        request.push(0x00);
        if ip.is_none() {
            request.extend_from_slice(self.target_host.as_bytes());
            request.push(0x00);
        }
        stream.write_all(&request).await?;

        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await?;
        if reply[1] != 0x5A {
            return Err(refused(ep, &format!("request rejected (code {:#x})", reply[1])));
        }
        Ok(())
    }

    async fn http_connect(&self, stream: &mut TcpStream, ep: &ProxyEndpoint) -> Result<()> {
        let target = format!("{}:{}", self.target_host, self.target_port);
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some((user, pass)) = ep.credentials() {
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
            request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut response: Vec<u8> = Vec::new();
        let mut buf = [0u8; 512];
        while !response.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await?;
            if n == 0 || response.len() > MAX_CONNECT_RESPONSE {
                return Err(refused(ep, "incomplete CONNECT response"));
            }
            response.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8_lossy(&response);
        let status_line = text.lines().next().unwrap_or_default();
        if status_line.split_whitespace().nth(1) != Some("200") {
            return Err(refused(ep, status_line));
        }
        Ok(())
    }
}

fn refused(ep: &ProxyEndpoint, reason: &str) -> RelayError {
    RelayError::ProxyUnreachable(format!("{}: {reason}", ep.name))
}

#[async_trait]
impl Prober for TunnelProbe {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> bool {
        match tokio::time::timeout(self.timeout, self.tunnel(endpoint)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("Proxy probe failed {}: {e}", endpoint.name);
                false
            }
            Err(_) => {
                tracing::debug!(
                    "Proxy probe timed out {} after {}s",
                    endpoint.name,
                    self.timeout.as_secs()
                );
                false
            }
        }
    }
}

/// Probes with a real request through the same transport the forwarder
/// uses. Any HTTP answer counts except a proxy auth challenge.
pub struct TransportProbe {
    url: String,
    transport: HttpTransportFactory,
}

impl TransportProbe {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            transport: HttpTransportFactory::new(timeout),
        }
    }
}

#[async_trait]
impl Prober for TransportProbe {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> bool {
        let client = match self.transport.build(Some(&endpoint.egress())) {
            Ok(client) => client,
            Err(e) => {
                tracing::debug!("Proxy probe failed {}: {e}", endpoint.name);
                return false;
            }
        };
        match client.get(&self.url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                tracing::debug!("Proxy probe failed {}: auth required", endpoint.name);
                false
            }
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Proxy probe failed {}: {e}", endpoint.name);
                false
            }
        }
    }
}
