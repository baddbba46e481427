//! Dispatch queue: holds bundles until their jittered send time, then hands
//! them to the forwarder from a fixed-interval poll loop.
//! Every mutation is snapshotted with absolute wall-clock times, so pending
//! schedules survive a restart.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mediarelay_core::config::QueueConfig;
use mediarelay_core::{
    Artifact, Bundle, BundleRejected, BundleSink, Clock, Forwarder, RelayError, Result,
    SnapshotStorage, SystemClock,
};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::item::{ItemStatus, QueuedItem};
use crate::store::{QueueSnapshot, QueueStats};

/// Upper bound of the jitter added to every batch slot.
const BATCH_JITTER_SECS: f64 = 300.0;

/// Read-only view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub enabled: bool,
    pub processing: bool,
    /// Entries not yet terminal, including those being sent right now.
    pub pending_count: usize,
    /// Waiting entries whose send time has passed.
    pub ready_count: usize,
    pub in_flight: usize,
    pub total_queued: u64,
    pub total_sent: u64,
    pub total_failed: u64,
    /// Seconds until the earliest waiting entry is due (0 if overdue).
    pub next_send_in_seconds: Option<i64>,
    pub capacity: usize,
    pub batch_mode: bool,
}

/// What one poll tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Entries that reached a terminal outcome this tick.
    pub finished: Vec<QueuedItem>,
    /// IDs of entries rescheduled after a failed attempt.
    pub retried: Vec<String>,
}

impl TickReport {
    pub fn sent(&self) -> usize {
        self.finished
            .iter()
            .filter(|i| i.status == ItemStatus::Sent)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.finished
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .count()
    }
}

#[derive(Default)]
struct QueueState {
    /// Waiting entries, kept sorted by `QueuedItem::order_key`.
    pending: Vec<QueuedItem>,
    /// Entries taken by the current tick and being sent.
    in_flight: Vec<QueuedItem>,
    stats: QueueStats,
    next_seq: u64,
}

impl QueueState {
    fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    fn contains_source(&self, message_id: i64) -> bool {
        self.pending
            .iter()
            .chain(self.in_flight.iter())
            .any(|i| i.message_id == message_id)
    }

    fn insert(&mut self, mut item: QueuedItem) {
        item.seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(item);
        self.pending.sort_by_key(QueuedItem::order_key);
    }

    fn snapshot(&self, saved_at: DateTime<Utc>) -> QueueSnapshot {
        let mut queue: Vec<QueuedItem> = self.in_flight.clone();
        queue.extend(self.pending.iter().cloned());
        QueueSnapshot {
            queue,
            stats: self.stats,
            saved_at,
        }
    }
}

struct Worker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The dispatch queue.
pub struct DispatchQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    storage: Option<Box<dyn SnapshotStorage>>,
    clock: Arc<dyn Clock>,
    worker: Mutex<Option<Worker>>,
}

impl DispatchQueue {
    /// Create a queue, restoring the last snapshot from `storage` when
    /// auto-save is enabled.
    pub fn new(
        config: QueueConfig,
        storage: Option<Box<dyn SnapshotStorage>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let storage = if config.auto_save { storage } else { None };
        let mut state = QueueState::default();
        if let Some(storage) = &storage {
            restore(&mut state, storage.as_ref());
        }
        Self {
            config,
            state: Mutex::new(state),
            storage,
            clock,
            worker: Mutex::new(None),
        }
    }

    /// Volatile queue with the system clock.
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(config, None, Arc::new(SystemClock))
    }

    /// Queue a bundle with default priority. Returns the entry ID.
    pub async fn enqueue(&self, bundle: Bundle) -> std::result::Result<String, BundleRejected> {
        self.enqueue_with_priority(bundle, 0).await
    }

    /// Queue a bundle. On rejection the bundle, and the duty to release its
    /// artifacts, goes back to the caller.
    pub async fn enqueue_with_priority(
        &self,
        bundle: Bundle,
        priority: u8,
    ) -> std::result::Result<String, BundleRejected> {
        if bundle.is_empty() {
            return Err(BundleRejected {
                reason: RelayError::EmptyBundle,
                bundle,
            });
        }

        let mut state = self.state.lock().await;
        if state.len() >= self.config.max_queue_size {
            tracing::warn!(
                "⚠️ Queue full ({}), rejecting item {}",
                self.config.max_queue_size,
                bundle.source_id()
            );
            return Err(BundleRejected {
                reason: RelayError::QueueFull {
                    capacity: self.config.max_queue_size,
                },
                bundle,
            });
        }
        if state.contains_source(bundle.source_id()) {
            return Err(BundleRejected {
                reason: RelayError::DuplicateItem(bundle.source_id()),
                bundle,
            });
        }

        let now = self.clock.now();
        let delay = self.schedule_delay(state.len());
        let item = QueuedItem::from_bundle(
            bundle,
            now + delay,
            now,
            priority,
            self.config.max_retries,
        );
        let id = item.id.clone();
        tracing::info!(
            "📋 Item {} queued, sending in {:.1} min (queue: {})",
            item.message_id,
            delay.num_seconds() as f64 / 60.0,
            state.len() + 1
        );
        state.insert(item);
        state.stats.total_queued += 1;
        self.persist(&state);
        Ok(id)
    }

    /// Delay before a new entry at `position` (its rank among entries
    /// already queued) is due.
    fn schedule_delay(&self, position: usize) -> chrono::Duration {
        let mut rng = rand::thread_rng();
        let secs = if self.config.batch_send_enabled {
            let batch = (position / self.config.batch_size.max(1)) as f64;
            batch * self.config.batch_interval_secs as f64 + rng.gen_range(0.0..=BATCH_JITTER_SECS)
        } else {
            rng.gen_range(
                self.config.min_send_delay_secs as f64..=self.config.max_send_delay_secs as f64,
            )
        };
        chrono::Duration::milliseconds((secs * 1000.0) as i64)
    }

    fn retry_delay(&self) -> chrono::Duration {
        let secs = rand::thread_rng()
            .gen_range(self.config.retry_min_secs as f64..=self.config.retry_max_secs as f64);
        chrono::Duration::milliseconds((secs * 1000.0) as i64)
    }

    /// One poll tick: dispatch every due entry in queue order.
    ///
    /// Due entries move to the in-flight list (still part of every snapshot)
    /// while the forwarder runs, so the lock is never held across a send.
    pub async fn tick(&self, forwarder: &dyn Forwarder) -> TickReport {
        let mut report = TickReport::default();
        let ready = {
            let mut state = self.state.lock().await;
            let now = self.clock.now();
            let (ready, waiting): (Vec<QueuedItem>, Vec<QueuedItem>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|i| i.is_ready(now));
            state.pending = waiting;
            state.in_flight.extend(ready.iter().cloned());
            ready
        };

        for mut item in ready {
            let outcome = dispatch(forwarder, &item).await;

            let mut state = self.state.lock().await;
            state.in_flight.retain(|i| i.id != item.id);
            match outcome {
                Ok(()) => {
                    state.stats.total_sent += 1;
                    item.status = ItemStatus::Sent;
                    tracing::info!("✅ Queued item {} sent", item.message_id);
                    self.persist(&state);
                    drop(state);
                    Artifact::release_all(&item.files).await;
                    report.finished.push(item);
                }
                Err(e) if item.can_retry() => {
                    item.retry_count += 1;
                    let delay = self.retry_delay();
                    item.send_time = self.clock.now() + delay;
                    tracing::warn!(
                        "⚠️ Queued item {} failed: {e}; retrying in {:.1} min ({}/{})",
                        item.message_id,
                        delay.num_seconds() as f64 / 60.0,
                        item.retry_count,
                        item.max_retries
                    );
                    report.retried.push(item.id.clone());
                    state.insert(item);
                    self.persist(&state);
                }
                Err(e) => {
                    state.stats.total_failed += 1;
                    item.status = ItemStatus::Failed;
                    let terminal = RelayError::PermanentDispatch {
                        retries: item.retry_count,
                        reason: e.to_string(),
                    };
                    tracing::error!("❌ Queued item {}: {terminal}", item.message_id);
                    self.persist(&state);
                    drop(state);
                    Artifact::release_all(&item.files).await;
                    report.finished.push(item);
                }
            }
        }

        report
    }

    /// Start the background poll loop. Returns false if it is already running.
    pub async fn start_processing(self: &Arc<Self>, forwarder: Arc<dyn Forwarder>) -> bool {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            tracing::warn!("⚠️ Queue processor already running");
            return false;
        }

        let period = std::time::Duration::from_secs(self.config.check_interval_secs.max(1));
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {}
                }
                // Runs to completion: a stop request is only seen between ticks.
                let report = queue.tick(forwarder.as_ref()).await;
                if !report.finished.is_empty() || !report.retried.is_empty() {
                    tracing::debug!(
                        "⏱️ Tick: {} sent, {} failed, {} retried",
                        report.sent(),
                        report.failed(),
                        report.retried.len()
                    );
                }
            }
        });

        *worker = Some(Worker { stop_tx, handle });
        tracing::info!(
            "🚀 Queue processor started (check every {}s)",
            period.as_secs()
        );
        true
    }

    /// Stop the poll loop after its current tick completes.
    pub async fn stop_processing(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.stop_tx.send(true).ok();
            if let Err(e) = worker.handle.await {
                tracing::error!("❌ Queue processor ended abnormally: {e}");
            }
            tracing::info!("🛑 Queue processor stopped");
        }
    }

    pub async fn is_processing(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Snapshot of counters and timing.
    pub async fn get_status(&self) -> QueueStatus {
        let processing = self.is_processing().await;
        let state = self.state.lock().await;
        let now = self.clock.now();
        let ready_count = state.pending.iter().filter(|i| i.is_ready(now)).count();
        let next_send_in_seconds = state
            .pending
            .iter()
            .map(|i| i.send_time)
            .min()
            .map(|t| (t - now).num_seconds().max(0));
        QueueStatus {
            enabled: self.config.enabled,
            processing,
            pending_count: state.len(),
            ready_count,
            in_flight: state.in_flight.len(),
            total_queued: state.stats.total_queued,
            total_sent: state.stats.total_sent,
            total_failed: state.stats.total_failed,
            next_send_in_seconds,
            capacity: self.config.max_queue_size,
            batch_mode: self.config.batch_send_enabled,
        }
    }

    /// Copy of the waiting entries in queue order.
    pub async fn pending_items(&self) -> Vec<QueuedItem> {
        self.state.lock().await.pending.clone()
    }

    /// Remove every waiting entry and hand them, with their artifacts, to
    /// the caller.
    pub async fn take_all(&self) -> Vec<QueuedItem> {
        let mut state = self.state.lock().await;
        let removed = std::mem::take(&mut state.pending);
        self.persist(&state);
        tracing::info!("🧹 Queue cleared, removed {} items", removed.len());
        removed
    }

    /// Empty the queue. Artifacts are left on disk.
    pub async fn clear(&self) -> usize {
        self.take_all().await.len()
    }

    /// Write the current state to storage. Failures are logged only: the
    /// in-memory queue stays authoritative.
    fn persist(&self, state: &QueueState) {
        let Some(storage) = &self.storage else {
            return;
        };
        let result: Result<()> = state
            .snapshot(self.clock.now())
            .to_bytes()
            .and_then(|bytes| storage.write(&bytes));
        if let Err(e) = result {
            tracing::error!("❌ Failed to save queue to {}: {e}", storage.location());
        }
    }
}

#[async_trait]
impl BundleSink for DispatchQueue {
    async fn accept(&self, bundle: Bundle) -> std::result::Result<(), BundleRejected> {
        self.enqueue(bundle).await.map(|_| ())
    }
}

/// Send one entry through the forwarder.
async fn dispatch(forwarder: &dyn Forwarder, item: &QueuedItem) -> Result<()> {
    if item.is_text_only() {
        forwarder.send_text(&item.text_content).await
    } else {
        let caption = item.caption_source();
        forwarder.send(caption.as_ref(), &item.files).await
    }
}

/// Rebuild queue state from the last snapshot, if any.
fn restore(state: &mut QueueState, storage: &dyn SnapshotStorage) {
    let bytes = match storage.read() {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return,
        Err(e) => {
            tracing::error!("❌ Failed to load queue: {e}");
            return;
        }
    };
    match QueueSnapshot::from_bytes(&bytes) {
        Ok(snapshot) => {
            state.stats = snapshot.stats;
            let count = snapshot.queue.len();
            for item in snapshot.queue {
                state.insert(item);
            }
            tracing::info!(
                "📂 Restored {} queued items from {}",
                count,
                storage.location()
            );
        }
        Err(e) => tracing::error!("❌ Failed to parse queue snapshot: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;
    use mediarelay_core::{InboundItem, ItemRef, MediaKind};
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wall clock the test moves by hand.
    struct ManualClock(StdMutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Utc::now())))
        }

        fn advance(&self, secs: i64) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Forwarder that fails the first `fail_first` attempts.
    #[derive(Default)]
    struct ScriptedForwarder {
        fail_first: usize,
        attempts: AtomicUsize,
        sent: StdMutex<Vec<String>>,
    }

    impl ScriptedForwarder {
        fn failing(n: usize) -> Self {
            Self {
                fail_first: n,
                ..Default::default()
            }
        }

        fn record(&self, what: String) -> Result<()> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(RelayError::TransientDispatch(format!("attempt {n}")));
            }
            self.sent.lock().unwrap().push(what);
            Ok(())
        }
    }

    #[async_trait]
    impl Forwarder for ScriptedForwarder {
        async fn send(&self, caption: Option<&ItemRef>, artifacts: &[Artifact]) -> Result<()> {
            let caption = caption.map(|c| c.text.clone()).unwrap_or_default();
            self.record(format!("media:{}:{}", artifacts.len(), caption))
        }

        async fn send_text(&self, text: &str) -> Result<()> {
            self.record(format!("text:{text}"))
        }
    }

    fn config() -> QueueConfig {
        QueueConfig {
            min_send_delay_secs: 300,
            max_send_delay_secs: 7200,
            max_queue_size: 10,
            ..QueueConfig::default()
        }
    }

    fn text_bundle(id: i64) -> Bundle {
        Bundle::singleton(&InboundItem::new(id, &format!("msg {id}")), vec![], Utc::now())
    }

    fn media_bundle(id: i64) -> Bundle {
        Bundle::singleton(
            &InboundItem::new(id, "photo caption"),
            vec![Artifact::new(
                format!("/nonexistent/mediarelay/{id}.jpg"),
                MediaKind::Photo,
                1,
            )],
            Utc::now(),
        )
    }

    fn queue_with(config: QueueConfig, clock: Arc<ManualClock>) -> DispatchQueue {
        DispatchQueue::new(config, None, clock)
    }

    /// Lets the test keep a handle on storage owned by the queue.
    struct Shared(Arc<MemoryStorage>);

    impl SnapshotStorage for Shared {
        fn read(&self) -> Result<Option<Vec<u8>>> {
            self.0.read()
        }
        fn write(&self, bytes: &[u8]) -> Result<()> {
            self.0.write(bytes)
        }
        fn location(&self) -> String {
            self.0.location()
        }
    }

    /// Storage whose every write fails.
    #[derive(Default)]
    struct FailingStorage {
        attempts: Arc<AtomicUsize>,
    }

    impl SnapshotStorage for FailingStorage {
        fn read(&self) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn write(&self, _bytes: &[u8]) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(RelayError::Persistence("disk full".into()))
        }
        fn location(&self) -> String {
            "failing".into()
        }
    }

    /// Forwarder that captures the stored snapshot while a send is running.
    struct CapturingForwarder {
        storage: Arc<MemoryStorage>,
        captured: StdMutex<Option<Vec<u8>>>,
    }

    #[async_trait]
    impl Forwarder for CapturingForwarder {
        async fn send(&self, _caption: Option<&ItemRef>, _artifacts: &[Artifact]) -> Result<()> {
            Ok(())
        }

        async fn send_text(&self, _text: &str) -> Result<()> {
            *self.captured.lock().unwrap() = self.storage.read()?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_enqueue_six_none_ready() {
        let clock = ManualClock::new();
        let queue = queue_with(config(), clock.clone());
        for id in 1..=6 {
            assert!(queue.enqueue(text_bundle(id)).await.is_ok());
        }
        let status = queue.get_status().await;
        assert_eq!(status.pending_count, 6);
        assert_eq!(status.ready_count, 0);
        assert_eq!(status.total_queued, 6);
        let next = status.next_send_in_seconds.unwrap();
        assert!((299..=7200).contains(&next));
    }

    #[tokio::test]
    async fn test_enqueue_rejected_when_full() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.max_queue_size = 2;
        let queue = queue_with(cfg, clock);
        queue.enqueue(text_bundle(1)).await.unwrap();
        queue.enqueue(text_bundle(2)).await.unwrap();

        let rejected = queue.enqueue(media_bundle(3)).await.unwrap_err();
        assert!(matches!(rejected.reason, RelayError::QueueFull { capacity: 2 }));
        // Ownership goes back with the bundle.
        assert_eq!(rejected.bundle.artifacts.len(), 1);
        assert_eq!(queue.get_status().await.pending_count, 2);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_and_empty() {
        let clock = ManualClock::new();
        let queue = queue_with(config(), clock);
        queue.enqueue(text_bundle(1)).await.unwrap();
        let dup = queue.enqueue(text_bundle(1)).await.unwrap_err();
        assert!(matches!(dup.reason, RelayError::DuplicateItem(1)));

        let empty = Bundle::singleton(&InboundItem::new(9, ""), vec![], Utc::now());
        let err = queue.enqueue(empty).await.unwrap_err();
        assert!(matches!(err.reason, RelayError::EmptyBundle));
        assert_eq!(queue.get_status().await.pending_count, 1);
    }

    #[tokio::test]
    async fn test_queue_order_priority_then_time() {
        let clock = ManualClock::new();
        let mut cfg = config();
        cfg.min_send_delay_secs = 60;
        cfg.max_send_delay_secs = 60;
        let queue = queue_with(cfg, clock);
        queue.enqueue_with_priority(text_bundle(1), 5).await.unwrap();
        queue.enqueue_with_priority(text_bundle(2), 0).await.unwrap();
        queue.enqueue_with_priority(text_bundle(3), 5).await.unwrap();

        let ids: Vec<i64> = queue
            .pending_items()
            .await
            .iter()
            .map(|i| i.message_id)
            .collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn test_batch_mode_slots() {
        let clock = ManualClock::new();
        let cfg = QueueConfig {
            batch_send_enabled: true,
            batch_size: 2,
            batch_interval_secs: 3600,
            ..config()
        };
        let queue = queue_with(cfg, clock.clone());
        for id in 1..=5 {
            queue.enqueue(text_bundle(id)).await.unwrap();
        }
        let now = clock.now();
        let mut offsets: Vec<(i64, i64)> = queue
            .pending_items()
            .await
            .iter()
            .map(|i| (i.message_id, (i.send_time - now).num_seconds()))
            .collect();
        offsets.sort();
        for (id, secs) in offsets {
            let slot = (id - 1) / 2;
            assert!(secs >= slot * 3600 && secs <= slot * 3600 + 300, "item {id} at {secs}s");
        }
    }

    #[tokio::test]
    async fn test_due_item_is_sent() {
        let clock = ManualClock::new();
        let queue = queue_with(config(), clock.clone());
        queue.enqueue(media_bundle(1)).await.unwrap();
        queue.enqueue(text_bundle(2)).await.unwrap();
        let forwarder = ScriptedForwarder::default();

        let report = queue.tick(&forwarder).await;
        assert!(report.finished.is_empty());

        clock.advance(7201);
        let report = queue.tick(&forwarder).await;
        assert_eq!(report.sent(), 2);
        let sent = forwarder.sent.lock().unwrap().clone();
        assert!(sent.contains(&"media:1:photo caption".to_string()));
        assert!(sent.contains(&"text:msg 2".to_string()));

        let status = queue.get_status().await;
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.total_sent, 2);
        assert_eq!(status.total_failed, 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let clock = ManualClock::new();
        let queue = queue_with(config(), clock.clone());
        queue.enqueue(text_bundle(1)).await.unwrap();
        // Fails twice (k = 2 < max_retries = 3), then succeeds.
        let forwarder = ScriptedForwarder::failing(2);

        clock.advance(7201);
        for attempt in 1..=2 {
            let report = queue.tick(&forwarder).await;
            assert_eq!(report.retried.len(), 1);
            let pending = queue.pending_items().await;
            assert_eq!(pending[0].retry_count, attempt);
            let wait = (pending[0].send_time - clock.now()).num_seconds();
            assert!((299..=900).contains(&wait));
            // Not due yet.
            assert!(queue.tick(&forwarder).await.retried.is_empty());
            clock.advance(901);
        }
        let report = queue.tick(&forwarder).await;
        assert_eq!(report.sent(), 1);

        let status = queue.get_status().await;
        assert_eq!(status.total_sent, 1);
        assert_eq!(status.total_failed, 0);
        assert_eq!(status.pending_count, 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let clock = ManualClock::new();
        let queue = queue_with(config(), clock.clone());
        queue.enqueue(text_bundle(1)).await.unwrap();
        let forwarder = ScriptedForwarder::failing(usize::MAX);

        clock.advance(7201);
        // max_retries + 1 attempts.
        for _ in 0..4 {
            queue.tick(&forwarder).await;
            clock.advance(901);
        }
        let status = queue.get_status().await;
        assert_eq!(status.total_failed, 1);
        assert_eq!(status.total_sent, 0);
        assert_eq!(status.pending_count, 0);
        assert_eq!(forwarder.attempts.load(Ordering::SeqCst), 4);

        // Never dispatched again.
        clock.advance(10_000);
        queue.tick(&forwarder).await;
        assert_eq!(forwarder.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_across_restart() {
        let clock = ManualClock::new();
        let storage = Arc::new(MemoryStorage::new());

        let queue = DispatchQueue::new(config(), Some(Box::new(Shared(storage.clone()))), clock.clone());
        queue.enqueue(media_bundle(1)).await.unwrap();
        queue.enqueue(text_bundle(2)).await.unwrap();
        queue.enqueue_with_priority(text_bundle(3), 1).await.unwrap();
        assert_eq!(storage.write_count(), 3);
        let before = queue.pending_items().await;

        let restored = DispatchQueue::new(config(), Some(Box::new(Shared(storage.clone()))), clock);
        let after = restored.pending_items().await;
        assert_eq!(before.len(), after.len());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.message_id, b.message_id);
            assert_eq!(a.send_time, b.send_time);
            assert_eq!(a.files, b.files);
            assert_eq!(a.text_content, b.text_content);
            assert_eq!(a.priority, b.priority);
        }
        assert_eq!(restored.get_status().await.total_queued, 3);
    }

    #[tokio::test]
    async fn test_snapshot_written_on_every_outcome() {
        let clock = ManualClock::new();
        let storage = Arc::new(MemoryStorage::new());
        let cfg = QueueConfig {
            max_retries: 0,
            ..config()
        };
        let queue = DispatchQueue::new(cfg.clone(), Some(Box::new(Shared(storage.clone()))), clock.clone());
        queue.enqueue(text_bundle(1)).await.unwrap();
        queue.enqueue(text_bundle(2)).await.unwrap();
        assert_eq!(storage.write_count(), 2);

        // First attempt fails terminally, the second is sent.
        clock.advance(7201);
        let report = queue.tick(&ScriptedForwarder::failing(1)).await;
        assert_eq!(report.failed(), 1);
        assert_eq!(report.sent(), 1);
        assert_eq!(storage.write_count(), 4);

        queue.enqueue(text_bundle(3)).await.unwrap();
        assert_eq!(queue.clear().await, 1);
        assert_eq!(storage.write_count(), 6);

        let restored = DispatchQueue::new(cfg, Some(Box::new(Shared(storage.clone()))), clock);
        let status = restored.get_status().await;
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.total_queued, 3);
        assert_eq!(status.total_sent, 1);
        assert_eq!(status.total_failed, 1);
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_does_not_stop_dispatch() {
        let clock = ManualClock::new();
        let storage = FailingStorage::default();
        let attempts = storage.attempts.clone();
        let queue = DispatchQueue::new(config(), Some(Box::new(storage)), clock.clone());

        assert!(queue.enqueue(media_bundle(1)).await.is_ok());
        assert!(queue.enqueue(text_bundle(2)).await.is_ok());
        assert_eq!(queue.get_status().await.pending_count, 2);

        clock.advance(7201);
        let forwarder = ScriptedForwarder::default();
        let report = queue.tick(&forwarder).await;
        assert_eq!(report.sent(), 2);
        assert_eq!(forwarder.sent.lock().unwrap().len(), 2);

        let status = queue.get_status().await;
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.total_queued, 2);
        assert_eq!(status.total_sent, 2);
        assert_eq!(status.total_failed, 0);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_in_flight_entry_survives_crash_mid_send() {
        let clock = ManualClock::new();
        let storage = Arc::new(MemoryStorage::new());
        let queue = DispatchQueue::new(config(), Some(Box::new(Shared(storage.clone()))), clock.clone());
        let id = queue.enqueue(text_bundle(7)).await.unwrap();

        clock.advance(7201);
        let forwarder = CapturingForwarder {
            storage: storage.clone(),
            captured: StdMutex::new(None),
        };
        assert_eq!(queue.tick(&forwarder).await.sent(), 1);

        // Restart from what was on disk while the send was running.
        let mid_send = forwarder.captured.lock().unwrap().take().unwrap();
        let crashed = Arc::new(MemoryStorage::new());
        crashed.write(&mid_send).unwrap();
        let restored = DispatchQueue::new(config(), Some(Box::new(Shared(crashed))), clock);

        let pending = restored.pending_items().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].message_id, 7);
        let status = restored.get_status().await;
        assert_eq!(status.ready_count, 1);
        assert_eq!(status.total_sent, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let clock = ManualClock::new();
        let queue = queue_with(config(), clock);
        queue.enqueue(text_bundle(1)).await.unwrap();
        queue.enqueue(text_bundle(2)).await.unwrap();
        assert_eq!(queue.clear().await, 2);
        let status = queue.get_status().await;
        assert_eq!(status.pending_count, 0);
        assert!(status.next_send_in_seconds.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_start_stop() {
        let mut cfg = config();
        cfg.min_send_delay_secs = 0;
        cfg.max_send_delay_secs = 0;
        cfg.check_interval_secs = 5;
        let queue = Arc::new(DispatchQueue::in_memory(cfg));
        queue.enqueue(text_bundle(1)).await.unwrap();

        let forwarder = Arc::new(ScriptedForwarder::default());
        assert!(queue.start_processing(forwarder.clone()).await);
        assert!(!queue.start_processing(forwarder.clone()).await);

        tokio::time::sleep(std::time::Duration::from_secs(6)).await;
        let status = queue.get_status().await;
        assert!(status.processing);
        assert_eq!(status.total_sent, 1);

        queue.stop_processing().await;
        assert!(!queue.is_processing().await);
    }

    /// Forwarder whose every send takes `delay`.
    struct SlowForwarder {
        delay: std::time::Duration,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Forwarder for SlowForwarder {
        async fn send(&self, _caption: Option<&ItemRef>, _artifacts: &[Artifact]) -> Result<()> {
            self.send_text("").await
        }

        async fn send_text(&self, _text: &str) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wins_over_overdue_tick() {
        let mut cfg = config();
        cfg.min_send_delay_secs = 0;
        cfg.max_send_delay_secs = 0;
        cfg.check_interval_secs = 5;
        let queue = Arc::new(DispatchQueue::in_memory(cfg));
        queue.enqueue(text_bundle(1)).await.unwrap();

        // Each send outlasts several intervals.
        let forwarder = Arc::new(SlowForwarder {
            delay: std::time::Duration::from_secs(20),
            attempts: AtomicUsize::new(0),
        });
        queue.start_processing(forwarder.clone()).await;
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(forwarder.attempts.load(Ordering::SeqCst), 1);

        queue.enqueue(text_bundle(2)).await.unwrap();
        queue.stop_processing().await;

        assert_eq!(forwarder.attempts.load(Ordering::SeqCst), 1);
        let status = queue.get_status().await;
        assert_eq!(status.total_sent, 1);
        assert_eq!(status.pending_count, 1);
    }
}
