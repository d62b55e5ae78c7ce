//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Mirror Configuration Constants
// ============================================================================

/// Default origin host.
pub const DEFAULT_ORIGIN: &str = "http://archive.ubuntu.com";

/// Default repository directory on the origin.
pub const DEFAULT_SOURCE_DIR: &str = "ubuntu";

/// Default key prefix in the destination bucket.
pub const DEFAULT_DEST_PREFIX: &str = "ubuntu";

/// Default distributions to mirror.
pub const DEFAULT_DISTS: &str = "jammy,jammy-updates,jammy-security";

/// Default architectures to mirror.
pub const DEFAULT_ARCHITECTURES: &str = "amd64,i386";

/// Default number of parallel content sync workers.
pub const DEFAULT_CONTENT_WORKERS: usize = 16;

/// Default number of index parser workers per distribution.
pub const DEFAULT_INDEX_WORKERS: usize = 4;

/// Default attempts per artifact upload and metadata stage.
pub const DEFAULT_MAX_RETRY: u32 = 5;

/// Default attempts per manifest or index fetch.
pub const DEFAULT_INDEX_RETRY: u32 = 3;

/// Default attempts per metadata flip.
pub const DEFAULT_FLIP_RETRY: u32 = 3;

/// Default flip backoff step in milliseconds (1s, 2s, ...).
pub const DEFAULT_FLIP_BACKOFF_MS: u64 = 1000;

/// Default items per store connection before it is recycled.
pub const DEFAULT_RECYCLE_AFTER: u32 = crate::storage::DEFAULT_RECYCLE_AFTER;

/// Default days a dated backup is kept before purge.
pub const DEFAULT_BACKUP_DAYS: u32 = 3;

/// Default origin request timeout in seconds.
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = crate::origin::http::DEFAULT_TIMEOUT_SECS;

/// Mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub origin: OriginConfig,
    pub mirror: DestinationConfig,
    pub workers: WorkerConfig,
    pub retry: RetryConfig,
    /// Local directory for cached index files
    pub cache_dir: PathBuf,
}

/// Where the repository is read from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    pub url: String,
    pub source_dir: String,
    pub timeout_secs: u64,
}

/// What is mirrored and where it lands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub dest_prefix: String,
    pub dists: Vec<String>,
    pub architectures: Vec<String>,
    pub backup_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub content_workers: usize,
    pub index_workers: usize,
    pub recycle_after: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retry: u32,
    pub index_retry: u32,
    pub flip_retry: u32,
    pub flip_backoff_ms: u64,
}

impl RetryConfig {
    pub fn flip_backoff(&self) -> Duration {
        Duration::from_millis(self.flip_backoff_ms)
    }
}

impl OriginConfig {
    /// Origin URL of the repository root, without a trailing slash
    pub fn base_url(&self) -> String {
        let url = self.url.trim_end_matches('/');
        let dir = self.source_dir.trim_matches('/');
        if dir.is_empty() {
            url.to_string()
        } else {
            format!("{}/{}", url, dir)
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    split_list(&std::env::var(name).unwrap_or_else(|_| default.to_string()))
}

/// Split a comma separated list, dropping empty entries
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl MirrorConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = MirrorConfig {
            origin: OriginConfig {
                url: std::env::var("MIRROR_ORIGIN").unwrap_or_else(|_| DEFAULT_ORIGIN.to_string()),
                source_dir: std::env::var("MIRROR_SOURCE_DIR")
                    .unwrap_or_else(|_| DEFAULT_SOURCE_DIR.to_string()),
                timeout_secs: env_or("MIRROR_HTTP_TIMEOUT", DEFAULT_HTTP_TIMEOUT_SECS),
            },
            mirror: DestinationConfig {
                dest_prefix: std::env::var("MIRROR_DEST_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_DEST_PREFIX.to_string()),
                dists: env_list("MIRROR_DISTS", DEFAULT_DISTS),
                architectures: env_list("MIRROR_ARCHITECTURES", DEFAULT_ARCHITECTURES),
                backup_days: env_or("MIRROR_BACKUP_DAYS", DEFAULT_BACKUP_DAYS),
            },
            workers: WorkerConfig {
                content_workers: env_or("MIRROR_CONTENT_WORKERS", DEFAULT_CONTENT_WORKERS),
                index_workers: env_or("MIRROR_INDEX_WORKERS", DEFAULT_INDEX_WORKERS),
                recycle_after: env_or("MIRROR_RECYCLE_AFTER", DEFAULT_RECYCLE_AFTER),
            },
            retry: RetryConfig {
                max_retry: env_or("MIRROR_MAX_RETRY", DEFAULT_MAX_RETRY),
                index_retry: env_or("MIRROR_INDEX_RETRY", DEFAULT_INDEX_RETRY),
                flip_retry: env_or("MIRROR_FLIP_RETRY", DEFAULT_FLIP_RETRY),
                flip_backoff_ms: env_or("MIRROR_FLIP_BACKOFF_MS", DEFAULT_FLIP_BACKOFF_MS),
            },
            cache_dir: std::env::var("MIRROR_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("aptmirror")),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.origin.url.starts_with("http://") && !self.origin.url.starts_with("https://") {
            anyhow::bail!("Origin URL must be http(s), got '{}'", self.origin.url);
        }

        if self.mirror.dists.is_empty() {
            anyhow::bail!("At least one distribution must be configured");
        }

        if self.mirror.architectures.is_empty() {
            anyhow::bail!("At least one architecture must be configured");
        }

        if self.workers.content_workers == 0 || self.workers.index_workers == 0 {
            anyhow::bail!("Worker counts must be greater than 0");
        }

        if self.retry.max_retry == 0 || self.retry.index_retry == 0 || self.retry.flip_retry == 0 {
            anyhow::bail!("Retry budgets must be greater than 0");
        }

        if self.workers.recycle_after == 0 {
            anyhow::bail!("recycle_after must be greater than 0");
        }

        if self.mirror.backup_days == 0 {
            tracing::warn!("Backups are tagged for purge on the day they are taken");
        }

        Ok(())
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            origin: OriginConfig {
                url: DEFAULT_ORIGIN.to_string(),
                source_dir: DEFAULT_SOURCE_DIR.to_string(),
                timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            },
            mirror: DestinationConfig {
                dest_prefix: DEFAULT_DEST_PREFIX.to_string(),
                dists: split_list(DEFAULT_DISTS),
                architectures: split_list(DEFAULT_ARCHITECTURES),
                backup_days: DEFAULT_BACKUP_DAYS,
            },
            workers: WorkerConfig {
                content_workers: DEFAULT_CONTENT_WORKERS,
                index_workers: DEFAULT_INDEX_WORKERS,
                recycle_after: DEFAULT_RECYCLE_AFTER,
            },
            retry: RetryConfig {
                max_retry: DEFAULT_MAX_RETRY,
                index_retry: DEFAULT_INDEX_RETRY,
                flip_retry: DEFAULT_FLIP_RETRY,
                flip_backoff_ms: DEFAULT_FLIP_BACKOFF_MS,
            },
            cache_dir: std::env::temp_dir().join("aptmirror"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(MirrorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_base_url_joins_cleanly() {
        let mut origin = MirrorConfig::default().origin;
        origin.url = "http://archive.ubuntu.com/".into();
        origin.source_dir = "/ubuntu/".into();
        assert_eq!(origin.base_url(), "http://archive.ubuntu.com/ubuntu");

        origin.source_dir = String::new();
        assert_eq!(origin.base_url(), "http://archive.ubuntu.com");
    }

    #[test]
    fn test_split_list_drops_blanks() {
        assert_eq!(split_list(" amd64, ,arm64 "), vec!["amd64", "arm64"]);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let mut config = MirrorConfig::default();
        config.workers.content_workers = 0;
        assert!(config.validate().is_err());
    }
}
