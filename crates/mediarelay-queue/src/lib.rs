//! # MediaRelay Queue
//!
//! Delayed dispatch with human-plausible timing.
//!
//! ## Design Principles
//! - No external broker: one in-process queue behind a single lock
//! - Snapshot on every mutation, keyed by wall-clock time, so it survives restarts
//! - Tokio interval poll loop, idle between ticks
//! - Transient failures retried with randomized backoff, then counted as failed
//!
//! ## Architecture
//! ```text
//! enqueue(bundle) ──► pending (priority, send_time, seq)
//!                         │ every check_interval
//!                         ▼
//!                     tick: due items → in_flight → Forwarder
//!                         ├── ok      → total_sent++, release artifacts
//!                         ├── err < N → retry_count++, reschedule 5–15 min
//!                         └── err = N → total_failed++, release artifacts
//!                     every mutation → SnapshotStorage (JSON file | SQLite)
//! ```

pub mod item;
pub mod persistence;
pub mod queue;
pub mod store;

pub use item::{ItemStatus, QueuedItem};
pub use persistence::SqliteStorage;
pub use queue::{DispatchQueue, QueueStatus, TickReport};
pub use store::{FileStorage, MemoryStorage, QueueSnapshot, QueueStats};
