//! MediaRelay configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::types::ProxyKind;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub grouping: GroupingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub proxy: ProxyPoolConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
}

impl RelayConfig {
    /// Load config from the default path (~/.mediarelay/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| RelayError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let g = &self.grouping;
        if g.settle_secs == 0 {
            return Err(RelayError::Config("grouping.settle_secs must be > 0".into()));
        }
        if g.max_wait_secs < g.settle_secs {
            return Err(RelayError::Config(
                "grouping.max_wait_secs must be >= grouping.settle_secs".into(),
            ));
        }
        let q = &self.queue;
        if q.min_send_delay_secs > q.max_send_delay_secs {
            return Err(RelayError::Config(
                "queue.min_send_delay_secs must be <= queue.max_send_delay_secs".into(),
            ));
        }
        if q.retry_min_secs > q.retry_max_secs {
            return Err(RelayError::Config(
                "queue.retry_min_secs must be <= queue.retry_max_secs".into(),
            ));
        }
        if q.batch_size == 0 {
            return Err(RelayError::Config("queue.batch_size must be > 0".into()));
        }
        if q.max_queue_size == 0 {
            return Err(RelayError::Config("queue.max_queue_size must be > 0".into()));
        }
        if q.check_interval_secs == 0 {
            return Err(RelayError::Config("queue.check_interval_secs must be > 0".into()));
        }
        parse_file_size(&self.download.max_file_size)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the MediaRelay home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".mediarelay")
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Parse a size such as `2GB`, `500MB`, `64KB` or a plain byte count.
pub fn parse_file_size(s: &str) -> Result<u64> {
    let s = s.trim().to_ascii_uppercase();
    let (digits, multiplier) = if let Some(n) = s.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024)
    } else {
        (s.as_str(), 1)
    };
    let n: u64 = digits
        .trim()
        .parse()
        .map_err(|_| RelayError::Config(format!("Invalid file size '{s}'")))?;
    if n == 0 {
        return Err(RelayError::Config("File size limit must be > 0".into()));
    }
    n.checked_mul(multiplier)
        .ok_or_else(|| RelayError::Config(format!("File size '{s}' is too large")))
}

fn bool_true() -> bool { true }

/// Debounce / ceiling / download timing for grouped items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Idle time after the last arrival before a group is settled.
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    /// Hard cap on the collection span measured from the first arrival.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

fn default_settle_secs() -> u64 { 3 }
fn default_max_wait_secs() -> u64 { 30 }
fn default_download_timeout_secs() -> u64 { 600 }

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            settle_secs: default_settle_secs(),
            max_wait_secs: default_max_wait_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

impl GroupingConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Where the queue snapshot is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Json,
    Sqlite,
}

/// Delayed dispatch queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_min_send_delay")]
    pub min_send_delay_secs: u64,
    #[serde(default = "default_max_send_delay")]
    pub max_send_delay_secs: u64,
    #[serde(default)]
    pub batch_send_enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_interval")]
    pub batch_interval_secs: u64,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_min")]
    pub retry_min_secs: u64,
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
    #[serde(default = "bool_true")]
    pub auto_save: bool,
    #[serde(default = "default_queue_save_path")]
    pub save_path: String,
    #[serde(default)]
    pub storage: StorageBackend,
}

fn default_min_send_delay() -> u64 { 300 }
fn default_max_send_delay() -> u64 { 7200 }
fn default_batch_size() -> usize { 5 }
fn default_batch_interval() -> u64 { 3600 }
fn default_max_queue_size() -> usize { 1000 }
fn default_check_interval() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_min() -> u64 { 300 }
fn default_retry_max() -> u64 { 900 }
fn default_queue_save_path() -> String { "~/.mediarelay/queue.json".into() }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_send_delay_secs: default_min_send_delay(),
            max_send_delay_secs: default_max_send_delay(),
            batch_send_enabled: false,
            batch_size: default_batch_size(),
            batch_interval_secs: default_batch_interval(),
            max_queue_size: default_max_queue_size(),
            check_interval_secs: default_check_interval(),
            max_retries: default_max_retries(),
            retry_min_secs: default_retry_min(),
            retry_max_secs: default_retry_max(),
            auto_save: true,
            save_path: default_queue_save_path(),
            storage: StorageBackend::default(),
        }
    }
}

/// Egress proxy pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyPoolConfig {
    /// Use the main proxy below when rotation is disabled.
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proxy_kind")]
    pub kind: ProxyKind,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub rotation_enabled: bool,
    #[serde(default = "default_rotation_interval")]
    pub rotation_interval_secs: u64,
    #[serde(default = "default_proxy_list_file")]
    pub list_file: String,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,
    /// Fixed target every reachability probe connects to through the proxy.
    #[serde(default = "default_probe_target")]
    pub probe_target: String,
    /// Probe with an HTTP request to this URL through the forwarder's
    /// transport instead of a raw tunnel to `probe_target`.
    #[serde(default)]
    pub probe_url: Option<String>,
}

fn default_proxy_kind() -> ProxyKind { ProxyKind::Socks5 }
fn default_proxy_port() -> u16 { 1080 }
fn default_rotation_interval() -> u64 { 3600 }
fn default_proxy_list_file() -> String { "~/.mediarelay/proxies.json".into() }
fn default_test_timeout() -> u64 { 10 }
fn default_probe_target() -> String { "149.154.167.50:443".into() }

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: default_proxy_kind(),
            host: String::new(),
            port: default_proxy_port(),
            username: None,
            password: None,
            rotation_enabled: false,
            rotation_interval_secs: default_rotation_interval(),
            list_file: default_proxy_list_file(),
            test_timeout_secs: default_test_timeout(),
            probe_target: default_probe_target(),
            probe_url: None,
        }
    }
}

/// Local staging of downloaded media.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: String,
    /// Staged files older than this are swept at startup. 0 disables it.
    #[serde(default = "default_cleanup_max_age")]
    pub cleanup_max_age_hours: u64,
}

fn default_staging_dir() -> String { "~/.mediarelay/downloads".into() }
fn default_max_file_size() -> String { "2GB".into() }
fn default_cleanup_max_age() -> u64 { 24 }

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            max_file_size: default_max_file_size(),
            cleanup_max_age_hours: default_cleanup_max_age(),
        }
    }
}

/// Outbound webhook the binary forwards bundles to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardConfig {
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default = "default_forward_timeout")]
    pub timeout_secs: u64,
}

fn default_forward_timeout() -> u64 { 30 }

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            timeout_secs: default_forward_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.grouping.settle_secs, 3);
        assert_eq!(config.queue.min_send_delay_secs, 300);
        assert_eq!(config.queue.max_send_delay_secs, 7200);
        assert_eq!(config.queue.storage, StorageBackend::Json);
        assert_eq!(config.proxy.kind, ProxyKind::Socks5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [grouping]
            settle_secs = 5
            max_wait_secs = 60

            [queue]
            batch_send_enabled = true
            batch_size = 10
            storage = "sqlite"

            [proxy]
            rotation_enabled = true
            kind = "http"
        "#;

        let config: RelayConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.grouping.settle_secs, 5);
        assert_eq!(config.grouping.max_wait(), Duration::from_secs(60));
        assert!(config.queue.batch_send_enabled);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.storage, StorageBackend::Sqlite);
        assert_eq!(config.proxy.kind, ProxyKind::Http);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: RelayConfig = toml::from_str("").unwrap();
        assert_eq!(config.queue.max_queue_size, 1000);
        assert_eq!(config.proxy.probe_target, "149.154.167.50:443");
    }

    #[test]
    fn test_validate_rejects_inverted_ranges() {
        let mut config = RelayConfig::default();
        config.queue.min_send_delay_secs = 100;
        config.queue.max_send_delay_secs = 10;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.grouping.max_wait_secs = 1;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.queue.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_file_size() {
        assert_eq!(parse_file_size("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_file_size("500mb").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_file_size("64KB").unwrap(), 64 * 1024);
        assert_eq!(parse_file_size("1234").unwrap(), 1234);
        assert!(parse_file_size("lots").is_err());
        assert!(parse_file_size("0MB").is_err());
    }

    #[test]
    fn test_parse_file_size_overflow_is_config_error() {
        let err = parse_file_size("99999999999GB").unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
        assert!(parse_file_size(&format!("{}KB", u64::MAX)).is_err());
    }

    #[test]
    fn test_home_dir() {
        let home = RelayConfig::home_dir();
        assert!(home.to_string_lossy().contains("mediarelay"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = RelayConfig::default();
        let text = config.to_toml().unwrap();
        let back: RelayConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.queue.save_path, config.queue.save_path);
    }
}
