//! Value types that flow through the relay pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Egress proxy protocol. Translated to library-specific values only where a
/// transport is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Socks4,
    Http,
}

impl ProxyKind {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Http => "http",
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.scheme())
    }
}

impl std::str::FromStr for ProxyKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socks5" | "socks5h" => Ok(ProxyKind::Socks5),
            "socks4" | "socks4a" => Ok(ProxyKind::Socks4),
            "http" | "https" => Ok(ProxyKind::Http),
            other => Err(format!("unknown proxy type '{other}'")),
        }
    }
}

/// Kind of a retrieved media artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    Animation,
    Document,
}

impl MediaKind {
    /// Guess the kind from a file extension (used by local downloaders).
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" | "png" | "webp" => MediaKind::Photo,
            "mp4" | "mov" | "mkv" | "webm" => MediaKind::Video,
            "mp3" | "m4a" | "flac" | "wav" => MediaKind::Audio,
            "ogg" | "oga" | "opus" => MediaKind::Voice,
            "gif" => MediaKind::Animation,
            _ => MediaKind::Document,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Voice => "voice",
            MediaKind::Animation => "animation",
            MediaKind::Document => "document",
        };
        f.write_str(s)
    }
}

/// A retrieved content artifact staged on local disk.
///
/// Owned by exactly one `Bundle` (and later one queued item) until a terminal
/// outcome, at which point [`Artifact::release`] deletes the staged file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    #[serde(default)]
    pub size: u64,
}

impl Artifact {
    pub fn new(path: impl Into<PathBuf>, kind: MediaKind, size: u64) -> Self {
        Self {
            path: path.into(),
            kind,
            size,
        }
    }

    /// Delete the staged file. A file that is already gone is not an error.
    pub async fn release(&self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => tracing::debug!("🧹 Released artifact {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("⚠️ Failed to release {}: {e}", self.path.display()),
        }
    }

    /// Release every artifact in the slice.
    pub async fn release_all(artifacts: &[Artifact]) {
        for artifact in artifacts {
            artifact.release().await;
        }
    }
}

/// One inbound item as handed to the aggregator by the listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundItem {
    /// Source message identifier.
    pub id: i64,
    /// Correlation id shared by items meant to be delivered together.
    #[serde(default)]
    pub group_key: Option<String>,
    /// Text or caption carried by the item.
    #[serde(default)]
    pub text: String,
    /// Opaque media handles understood by the `Downloader`.
    #[serde(default)]
    pub media: Vec<String>,
    /// Human-readable origin (channel title).
    #[serde(default = "default_source")]
    pub source: String,
}

fn default_source() -> String {
    "Unknown".into()
}

impl InboundItem {
    pub fn new(id: i64, text: &str) -> Self {
        Self {
            id,
            group_key: None,
            text: text.to_string(),
            media: Vec::new(),
            source: default_source(),
        }
    }

    pub fn with_group(mut self, key: &str) -> Self {
        self.group_key = Some(key.to_string());
        self
    }

    pub fn with_media(mut self, handle: &str) -> Self {
        self.media.push(handle.to_string());
        self
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef {
            id: self.id,
            text: self.text.clone(),
        }
    }
}

/// The fields of an inbound item a `Forwarder` needs once it is bundled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: i64,
    #[serde(default)]
    pub text: String,
}

/// One deliverable unit: a settled group or a singleton item.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    /// Absent for singleton items.
    pub group_key: Option<String>,
    /// Items in arrival order.
    pub items: Vec<ItemRef>,
    pub artifacts: Vec<Artifact>,
    /// First item (in arrival order) carrying non-empty text.
    pub caption_source: Option<ItemRef>,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Bundle {
    /// Assemble a bundle from items in arrival order.
    pub fn new(
        group_key: Option<String>,
        items: &[InboundItem],
        artifacts: Vec<Artifact>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let caption_source = items
            .iter()
            .find(|i| !i.text.trim().is_empty())
            .map(InboundItem::item_ref);
        let source = items
            .first()
            .map(|i| i.source.clone())
            .unwrap_or_else(default_source);
        Self {
            group_key,
            items: items.iter().map(InboundItem::item_ref).collect(),
            artifacts,
            caption_source,
            source,
            created_at,
        }
    }

    /// Wrap a single ungrouped item.
    pub fn singleton(item: &InboundItem, artifacts: Vec<Artifact>, created_at: DateTime<Utc>) -> Self {
        Self::new(None, std::slice::from_ref(item), artifacts, created_at)
    }

    /// Identity of the bundle in the dispatch queue: its first source item.
    pub fn source_id(&self) -> i64 {
        self.items.first().map(|i| i.id).unwrap_or_default()
    }

    pub fn caption(&self) -> &str {
        self.caption_source
            .as_ref()
            .map(|c| c.text.as_str())
            .unwrap_or("")
    }

    /// No artifacts and no text: never dispatched.
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty() && self.caption().is_empty()
    }

    /// Drop the bundle and delete its staged artifacts.
    pub async fn release(self) {
        Artifact::release_all(&self.artifacts).await;
    }
}
