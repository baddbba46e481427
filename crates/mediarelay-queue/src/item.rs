//! Queued item: the unit the dispatch queue schedules, retries and persists.

use chrono::{DateTime, Utc};
use mediarelay_core::{Artifact, Bundle, ItemRef};
use serde::{Deserialize, Serialize};

/// A bundle waiting for its scheduled send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedItem {
    /// Unique queue entry ID.
    pub id: String,
    /// Source item this entry was created for (first item of a group).
    pub message_id: i64,
    /// Correlation key of the originating group, if any.
    #[serde(default)]
    pub group_key: Option<String>,
    /// Every source item folded into this entry, in arrival order.
    #[serde(default)]
    pub item_ids: Vec<i64>,
    /// Human-readable origin.
    #[serde(default)]
    pub channel_title: String,
    /// Staged artifacts owned by this entry.
    #[serde(default)]
    pub files: Vec<Artifact>,
    /// Caption, or the whole payload for text-only entries.
    #[serde(default)]
    pub text_content: String,
    /// Which source item the caption came from.
    #[serde(default)]
    pub caption_id: Option<i64>,
    /// Absolute wall-clock send time.
    pub send_time: DateTime<Utc>,
    pub added_time: DateTime<Utc>,
    /// Lower sends first.
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(skip)]
    pub status: ItemStatus,
    /// Insertion order; breaks ties between equal send times.
    #[serde(skip)]
    pub seq: u64,
}

fn default_max_retries() -> u32 {
    3
}

/// Entry status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ItemStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

impl QueuedItem {
    /// Create an entry from a bundle. Artifact ownership moves into the entry.
    pub fn from_bundle(
        bundle: Bundle,
        send_time: DateTime<Utc>,
        added_time: DateTime<Utc>,
        priority: u8,
        max_retries: u32,
    ) -> Self {
        let message_id = bundle.source_id();
        let caption_id = bundle.caption_source.as_ref().map(|c| c.id);
        let text_content = bundle.caption().to_string();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_id,
            group_key: bundle.group_key,
            item_ids: bundle.items.iter().map(|i| i.id).collect(),
            channel_title: bundle.source,
            files: bundle.artifacts,
            text_content,
            caption_id,
            send_time,
            added_time,
            priority,
            retry_count: 0,
            max_retries,
            status: ItemStatus::Pending,
            seq: 0,
        }
    }

    /// Whether the entry is due at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.send_time <= now
    }

    /// The caption source as the forwarder sees it.
    pub fn caption_source(&self) -> Option<ItemRef> {
        self.caption_id.map(|id| ItemRef {
            id,
            text: self.text_content.clone(),
        })
    }

    /// Text-only entries go through `Forwarder::send_text`.
    pub fn is_text_only(&self) -> bool {
        self.files.is_empty()
    }

    /// Whether a failed attempt may be rescheduled.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Queue order key: priority, then send time, then insertion order.
    pub(crate) fn order_key(&self) -> (u8, DateTime<Utc>, u64) {
        (self.priority, self.send_time, self.seq)
    }
}
