//! Proxy pool: health-gated rotation over a fixed candidate list.
//!
//! Round-robin from the current slot: skip parked candidates, probe the rest,
//! commit to the first that answers. Nothing is ever removed from the list.
//! When a full cycle finds nothing, the failed-set is cleared and the
//! previous selection stays.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use mediarelay_core::config::{ProxyPoolConfig, expand_path};
use mediarelay_core::{RelayError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::endpoint::{EgressConfig, ProxyEndpoint};
use crate::list;
use crate::probe::{Prober, TransportProbe, TunnelProbe};

/// Selection state. Guarded as a whole so the index and the failed-set are
/// never observed mid-rotation.
struct PoolState {
    current: usize,
    /// `host:port` keys parked until the next full-cycle reset.
    failed: HashSet<String>,
    /// Monotonic time of the last rotation (pool creation until the first).
    last_rotation: Instant,
    last_rotation_at: Option<DateTime<Utc>>,
    rotations: u64,
}

/// Snapshot for status output.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStats {
    pub total_proxies: usize,
    pub current_index: usize,
    pub failed_count: usize,
    pub rotation_enabled: bool,
    pub rotations: u64,
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub current_name: Option<String>,
    pub current_host: Option<String>,
    pub current_port: Option<u16>,
}

pub struct ProxyPool {
    endpoints: Vec<ProxyEndpoint>,
    prober: Arc<dyn Prober>,
    rotation_enabled: bool,
    rotation_interval: Duration,
    state: Mutex<PoolState>,
}

impl ProxyPool {
    pub fn new(
        endpoints: Vec<ProxyEndpoint>,
        prober: Arc<dyn Prober>,
        rotation_enabled: bool,
        rotation_interval: Duration,
    ) -> Self {
        Self {
            endpoints,
            prober,
            rotation_enabled,
            rotation_interval,
            state: Mutex::new(PoolState {
                current: 0,
                failed: HashSet::new(),
                last_rotation: Instant::now(),
                last_rotation_at: None,
                rotations: 0,
            }),
        }
    }

    /// Build from config. With rotation off the pool holds only the main
    /// proxy (when enabled); with rotation on it holds the list file.
    pub fn from_config(config: &ProxyPoolConfig) -> Result<Self> {
        let endpoints = if config.rotation_enabled {
            match list::load_or_init(&expand_path(&config.list_file)) {
                Ok(list) => list,
                Err(e) => {
                    tracing::error!("❌ Failed to load proxy list: {e}");
                    Vec::new()
                }
            }
        } else if config.enabled && !config.host.is_empty() {
            let mut main = ProxyEndpoint::new(config.kind, &config.host, config.port).named("main_proxy");
            if let (Some(user), Some(pass)) = (&config.username, &config.password) {
                main = main.with_auth(user, pass);
            }
            vec![main]
        } else {
            Vec::new()
        };

        let timeout = Duration::from_secs(config.test_timeout_secs);
        let prober: Arc<dyn Prober> = match &config.probe_url {
            Some(url) => Arc::new(TransportProbe::new(url, timeout)),
            None => Arc::new(TunnelProbe::from_target(&config.probe_target, timeout)?),
        };
        Ok(Self::new(
            endpoints,
            prober,
            config.rotation_enabled,
            Duration::from_secs(config.rotation_interval_secs),
        ))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[ProxyEndpoint] {
        &self.endpoints
    }

    /// Transport configuration for the current candidate, rotating first
    /// when the rotation interval has elapsed. `None` for an empty pool.
    pub async fn get_current_config(&self) -> Option<EgressConfig> {
        if self.endpoints.is_empty() {
            return None;
        }
        let mut state = self.state.lock().await;
        if self.should_rotate(&state)
            && let Err(e) = self.rotate_locked(&mut state).await
        {
            tracing::warn!("⚠️ Scheduled proxy rotation failed: {e}");
        }
        Some(self.endpoints[state.current].egress())
    }

    fn should_rotate(&self, state: &PoolState) -> bool {
        self.rotation_enabled
            && self.endpoints.len() > 1
            && state.last_rotation.elapsed() >= self.rotation_interval
    }

    /// Move to the next reachable candidate. Returns its name.
    pub async fn rotate(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        self.rotate_locked(&mut state).await
    }

    /// Rotate regardless of the interval. Needs at least two candidates.
    pub async fn force_rotate(&self) -> Result<String> {
        if self.endpoints.len() < 2 {
            tracing::warn!("⚠️ Only {} proxy in pool, cannot rotate", self.endpoints.len());
            return Err(RelayError::Config(format!(
                "Proxy pool has {} candidate(s), need at least 2 to rotate",
                self.endpoints.len()
            )));
        }
        self.rotate().await
    }

    async fn rotate_locked(&self, state: &mut PoolState) -> Result<String> {
        let n = self.endpoints.len();
        if n == 0 {
            return Err(RelayError::NoReachableProxy);
        }
        let old = state.current;

        for step in 1..=n {
            let idx = (old + step) % n;
            let candidate = &self.endpoints[idx];
            let key = candidate.key();
            if state.failed.contains(&key) {
                tracing::debug!("⏭️ Skipping failed proxy: {}", candidate.name);
                continue;
            }
            if self.prober.probe(candidate).await {
                state.current = idx;
                state.last_rotation = Instant::now();
                state.last_rotation_at = Some(Utc::now());
                state.rotations += 1;
                tracing::info!(
                    "🔄 Proxy rotated: {} → {}",
                    self.endpoints[old].name,
                    candidate.name
                );
                return Ok(candidate.name.clone());
            }
            tracing::warn!("⚠️ Proxy unreachable, parking: {}", candidate.name);
            state.failed.insert(key);
        }

        tracing::warn!("⚠️ No reachable proxy, resetting failed list");
        state.failed.clear();
        Err(RelayError::NoReachableProxy)
    }

    /// Probe every candidate concurrently. Does not touch the selection.
    pub async fn test_all(&self) -> BTreeMap<String, bool> {
        tracing::info!("🔍 Testing {} proxies", self.endpoints.len());
        let probes = self.endpoints.iter().map(|ep| async move {
            let ok = self.prober.probe(ep).await;
            tracing::info!("  {} {}", if ok { "✅" } else { "❌" }, ep.name);
            (ep.name.clone(), ok)
        });
        let results: BTreeMap<String, bool> = join_all(probes).await.into_iter().collect();
        let reachable = results.values().filter(|ok| **ok).count();
        tracing::info!("📊 Proxy test done: {reachable}/{} reachable", results.len());
        results
    }

    pub async fn get_statistics(&self) -> ProxyStats {
        let state = self.state.lock().await;
        let current = self.endpoints.get(state.current);
        ProxyStats {
            total_proxies: self.endpoints.len(),
            current_index: state.current,
            failed_count: state.failed.len(),
            rotation_enabled: self.rotation_enabled,
            rotations: state.rotations,
            last_rotation_at: state.last_rotation_at,
            current_name: current.map(|ep| ep.name.clone()),
            current_host: current.map(|ep| ep.host.clone()),
            current_port: current.map(|ep| ep.port),
        }
    }

    /// One-line description of the current selection.
    pub async fn current_info(&self) -> String {
        let state = self.state.lock().await;
        let Some(ep) = self.endpoints.get(state.current) else {
            return "🚫 No proxy configured".to_string();
        };
        let auth = ep
            .credentials()
            .map(|(user, _)| format!(" (auth: {user})"))
            .unwrap_or_default();
        let rotation = if self.rotation_enabled && self.endpoints.len() > 1 {
            format!(" [rotation: {}/{}]", state.current + 1, self.endpoints.len())
        } else {
            String::new()
        };
        format!("🔗 {ep}{auth}{rotation}")
    }
}
