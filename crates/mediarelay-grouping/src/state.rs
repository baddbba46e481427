//! Per-group collection state.

use mediarelay_core::InboundItem;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of one group. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Collecting,
    Downloading,
    Completed,
    Abandoned,
}

impl GroupStatus {
    pub fn can_advance_to(self, next: GroupStatus) -> bool {
        matches!(
            (self, next),
            (GroupStatus::Collecting, GroupStatus::Downloading)
                | (GroupStatus::Downloading, GroupStatus::Completed)
                | (GroupStatus::Downloading, GroupStatus::Abandoned)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GroupStatus::Completed | GroupStatus::Abandoned)
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GroupStatus::Collecting => "collecting",
            GroupStatus::Downloading => "downloading",
            GroupStatus::Completed => "completed",
            GroupStatus::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct GroupState {
    pub key: String,
    /// Arrival order.
    pub items: Vec<InboundItem>,
    pub first_seen: Instant,
    pub last_seen: Instant,
    pub status: GroupStatus,
    pub download_started: Option<Instant>,
}

impl GroupState {
    pub fn new(key: &str, first: InboundItem, now: Instant) -> Self {
        Self {
            key: key.to_string(),
            items: vec![first],
            first_seen: now,
            last_seen: now,
            status: GroupStatus::Collecting,
            download_started: None,
        }
    }

    pub fn push(&mut self, item: InboundItem, now: Instant) {
        self.items.push(item);
        self.last_seen = now;
    }

    /// When the group settles if nothing else arrives: idle for `settle`,
    /// or `max_wait` after the first item, whichever comes first.
    pub fn settle_at(&self, settle: Duration, max_wait: Duration) -> Instant {
        (self.last_seen + settle).min(self.first_seen + max_wait)
    }

    /// Apply a transition. Backward or repeated transitions are refused.
    pub fn advance(&mut self, next: GroupStatus) -> bool {
        if !self.status.can_advance_to(next) {
            tracing::warn!("⚠️ Group {}: refused transition {} → {}", self.key, self.status, next);
            return false;
        }
        self.status = next;
        true
    }
}
