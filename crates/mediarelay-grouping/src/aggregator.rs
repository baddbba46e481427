//! Group aggregator: debounce plus ceiling over items sharing a group key.
//!
//! Each group gets exactly one timer task for its whole collection phase.
//! The task sleeps until the group's settle point, re-reads the state when
//! it wakes, and either sleeps again (a later arrival moved the settle
//! point) or settles the group. Arrivals only touch the shared map, so no
//! timer is ever cancelled or duplicated.

use mediarelay_core::config::GroupingConfig;
use mediarelay_core::{
    Artifact, Bundle, BundleSink, Clock, Downloader, InboundItem, RelayError, SystemClock,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;

use crate::state::{GroupState, GroupStatus};

pub struct GroupAggregator {
    config: GroupingConfig,
    downloader: Arc<dyn Downloader>,
    sink: Arc<dyn BundleSink>,
    clock: Arc<dyn Clock>,
    groups: Mutex<HashMap<String, GroupState>>,
    /// Timer and download tasks, reaped as they finish.
    tasks: Mutex<JoinSet<()>>,
    /// Set on shutdown: every collecting group settles at once.
    flush_tx: watch::Sender<bool>,
}

impl GroupAggregator {
    pub fn new(
        config: GroupingConfig,
        downloader: Arc<dyn Downloader>,
        sink: Arc<dyn BundleSink>,
    ) -> Self {
        Self::with_clock(config, downloader, sink, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: GroupingConfig,
        downloader: Arc<dyn Downloader>,
        sink: Arc<dyn BundleSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (flush_tx, _) = watch::channel(false);
        Self {
            config,
            downloader,
            sink,
            clock,
            groups: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            flush_tx,
        }
    }

    /// Accept one inbound item.
    pub async fn on_item(self: &Arc<Self>, item: InboundItem) {
        let Some(key) = item.group_key.clone() else {
            tracing::debug!("📨 Item {} has no group, delivering alone", item.id);
            self.spawn_singleton(item).await;
            return;
        };

        let now = self.clock.monotonic();
        let mut groups = self.groups.lock().await;
        match groups.get_mut(&key) {
            Some(state) if state.status == GroupStatus::Collecting => {
                state.push(item, now);
                tracing::debug!("📥 Group {key}: {} items", state.items.len());
            }
            Some(state) => {
                tracing::warn!(
                    "⚠️ Item {} arrived after group {key} closed ({}), delivering alone",
                    item.id,
                    state.status
                );
                drop(groups);
                self.spawn_singleton(item).await;
            }
            None => {
                tracing::debug!("🆕 Group {key} opened by item {}", item.id);
                groups.insert(key.clone(), GroupState::new(&key, item, now));
                drop(groups);
                let this = Arc::clone(self);
                self.spawn(async move { this.collect(key).await }).await;
            }
        }
    }

    /// Groups not yet handed off or abandoned.
    pub async fn active_groups(&self) -> usize {
        self.groups.lock().await.len()
    }

    pub async fn group_status(&self, key: &str) -> Option<GroupStatus> {
        self.groups.lock().await.get(key).map(|s| s.status)
    }

    /// Settle every open group now and wait for all downloads to finish.
    pub async fn shutdown(&self) {
        self.flush_tx.send_replace(true);
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if !tasks.is_empty() {
            tracing::info!("⏳ Draining {} grouping tasks", tasks.len());
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!("❌ Grouping task failed: {e}");
            }
        }
    }

    async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                tracing::error!("❌ Grouping task failed: {e}");
            }
        }
        tasks.spawn(task);
    }

    async fn spawn_singleton(self: &Arc<Self>, item: InboundItem) {
        let this = Arc::clone(self);
        self.spawn(async move { this.deliver_singleton(item).await }).await;
    }

    /// The group's single timer: sleep until the settle point, re-check.
    async fn collect(self: Arc<Self>, key: String) {
        let mut flush_rx = self.flush_tx.subscribe();
        loop {
            let settle_at = {
                let groups = self.groups.lock().await;
                let Some(state) = groups.get(&key) else { return };
                state.settle_at(self.config.settle(), self.config.max_wait())
            };
            if *flush_rx.borrow_and_update() || self.clock.monotonic() >= settle_at {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(settle_at) => {}
                _ = flush_rx.changed() => {}
            }
        }
        self.settle(&key).await;
    }

    async fn settle(&self, key: &str) {
        let started = self.clock.monotonic();
        let items = {
            let mut groups = self.groups.lock().await;
            let Some(state) = groups.get_mut(key) else { return };
            if !state.advance(GroupStatus::Downloading) {
                return;
            }
            state.download_started = Some(started);
            state.items.clone()
        };
        tracing::info!("📦 Group {key} settled with {} items, downloading", items.len());

        let deadline = started + self.config.download_timeout();
        let mut artifacts = Vec::new();
        let finished =
            tokio::time::timeout_at(deadline, self.fetch_all(&items, &mut artifacts)).await;

        let Some(mut state) = self.groups.lock().await.remove(key) else {
            Artifact::release_all(&artifacts).await;
            return;
        };

        if finished.is_err() {
            state.advance(GroupStatus::Abandoned);
            let err = RelayError::GroupDownloadTimeout {
                key: key.to_string(),
                elapsed_secs: started.elapsed().as_secs(),
            };
            tracing::warn!("⏰ {err}, discarding {} partial artifacts", artifacts.len());
            Artifact::release_all(&artifacts).await;
            return;
        }

        state.advance(GroupStatus::Completed);
        let bundle = Bundle::new(Some(key.to_string()), &state.items, artifacts, self.clock.now());
        self.emit(bundle).await;
    }

    async fn deliver_singleton(&self, item: InboundItem) {
        let deadline = self.clock.monotonic() + self.config.download_timeout();
        let mut artifacts = Vec::new();
        let items = std::slice::from_ref(&item);
        if tokio::time::timeout_at(deadline, self.fetch_all(items, &mut artifacts))
            .await
            .is_err()
        {
            tracing::warn!(
                "⏰ Item {} download timed out after {}s",
                item.id,
                self.config.download_timeout_secs
            );
            Artifact::release_all(&artifacts).await;
            return;
        }
        self.emit(Bundle::singleton(&item, artifacts, self.clock.now())).await;
    }

    /// Fetch in arrival order. Failed items are skipped; what was fetched
    /// stays in `artifacts` even if the caller's deadline cuts this short.
    async fn fetch_all(&self, items: &[InboundItem], artifacts: &mut Vec<Artifact>) {
        for item in items {
            match self.downloader.fetch(item).await {
                Ok(mut fetched) => artifacts.append(&mut fetched),
                Err(e) => tracing::warn!("⚠️ Download failed for item {}: {e}", item.id),
            }
        }
    }

    async fn emit(&self, bundle: Bundle) {
        let id = bundle.source_id();
        if bundle.is_empty() {
            tracing::info!("🗑️ Dropping empty bundle for item {id}");
            return;
        }
        let artifacts = bundle.artifacts.len();
        match self.sink.accept(bundle).await {
            Ok(()) => tracing::debug!("➡️ Bundle {id} handed off ({artifacts} artifacts)"),
            Err(rejected) => {
                tracing::warn!("⚠️ Bundle {id} rejected: {}", rejected.reason);
                rejected.bundle.release().await;
            }
        }
    }
}
