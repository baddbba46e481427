//! Local-file downloader: stages the files an inbound item points at.
//!
//! Media handles are paths on the local filesystem. Each one is copied into
//! the staging directory under a unique name, so the staged copy can be
//! released independently of the source.

use async_trait::async_trait;
use mediarelay_core::config::{DownloadConfig, expand_path, parse_file_size};
use mediarelay_core::{Artifact, Downloader, InboundItem, MediaKind, RelayError, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// File count and size of the staging directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagingStats {
    pub total_files: usize,
    pub total_bytes: u64,
}

pub struct LocalDownloader {
    staging_dir: PathBuf,
    max_file_size: u64,
}

impl LocalDownloader {
    pub fn new(staging_dir: PathBuf, max_file_size: u64) -> Result<Self> {
        std::fs::create_dir_all(&staging_dir)?;
        Ok(Self {
            staging_dir,
            max_file_size,
        })
    }

    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        Self::new(
            expand_path(&config.staging_dir),
            parse_file_size(&config.max_file_size)?,
        )
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Delete staged files last modified more than `max_age` ago, except
    /// those in `keep` (still owned by queued entries). Returns how many
    /// were removed.
    pub async fn cleanup_old_files(&self, max_age: Duration, keep: &HashSet<PathBuf>) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if keep.contains(&path) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            if meta.modified().is_ok_and(|t| t < cutoff) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        tracing::debug!("🗑️ Removed stale {}", path.display());
                        removed += 1;
                    }
                    Err(e) => tracing::warn!("⚠️ Could not remove {}: {e}", path.display()),
                }
            }
        }
        if removed > 0 {
            tracing::info!(
                "🧹 Removed {removed} staged files older than {}h",
                max_age.as_secs() / 3600
            );
        }
        Ok(removed)
    }

    /// Count the regular files in the staging directory and their total size.
    pub async fn stats(&self) -> Result<StagingStats> {
        let mut stats = StagingStats::default();
        let mut entries = tokio::fs::read_dir(&self.staging_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(meta) = entry.metadata().await
                && meta.is_file()
            {
                stats.total_files += 1;
                stats.total_bytes += meta.len();
            }
        }
        Ok(stats)
    }

    fn staged_name(&self, item: &InboundItem, source: &Path, index: usize) -> PathBuf {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bin".into());
        let name = if index > 0 {
            format!("{timestamp}_{}_{stem}_{index}.{ext}", item.id)
        } else {
            format!("{timestamp}_{}_{stem}.{ext}", item.id)
        };
        self.staging_dir.join(sanitize(&name))
    }
}

/// Replace characters that are unsafe in file names and cap the length.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if "<>:\"/\\|?*".contains(c) { '_' } else { c })
        .collect();
    if cleaned.chars().count() <= 255 {
        return cleaned;
    }
    match cleaned.rsplit_once('.') {
        Some((stem, ext)) => format!("{}.{ext}", stem.chars().take(250).collect::<String>()),
        None => cleaned.chars().take(255).collect(),
    }
}

#[async_trait]
impl Downloader for LocalDownloader {
    async fn fetch(&self, item: &InboundItem) -> Result<Vec<Artifact>> {
        let mut staged = Vec::new();
        for (index, handle) in item.media.iter().enumerate() {
            let source = expand_path(handle);
            let size = match tokio::fs::metadata(&source).await {
                Ok(meta) => meta.len(),
                Err(e) => {
                    Artifact::release_all(&staged).await;
                    return Err(RelayError::Download(format!("{}: {e}", source.display())));
                }
            };
            if size > self.max_file_size {
                tracing::warn!(
                    "⚠️ Skipping {} ({:.1}MB) over the {:.1}MB limit",
                    source.display(),
                    size as f64 / (1024.0 * 1024.0),
                    self.max_file_size as f64 / (1024.0 * 1024.0)
                );
                continue;
            }

            let target = self.staged_name(item, &source, index);
            if let Err(e) = tokio::fs::copy(&source, &target).await {
                Artifact::release_all(&staged).await;
                return Err(RelayError::Download(format!("{}: {e}", source.display())));
            }
            let kind = source
                .extension()
                .map(|e| MediaKind::from_extension(&e.to_string_lossy()))
                .unwrap_or(MediaKind::Document);
            tracing::debug!("📥 Staged {} as {}", source.display(), target.display());
            staged.push(Artifact::new(target, kind, size));
        }
        Ok(staged)
    }
}
