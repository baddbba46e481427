//! Time source with both clocks the pipeline needs.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock time persists schedules across restarts; monotonic time drives
/// in-process timers.
pub trait Clock: Send + Sync {
    /// Wall-clock now.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic now. Follows tokio's clock so paused-time tests apply.
    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// The real clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
