//! Work items, batches and rollback records

use aptmirror_common::Digest;
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tracing::warn;

/// One object to reconcile between the origin and the store
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Destination key, unique within its batch
    pub key: String,
    /// File name as listed by the index that referenced it
    pub name: Option<String>,
    pub remote_url: Option<String>,
    /// Local cache file; `None` means stream straight from `remote_url`
    pub cache_path: Option<PathBuf>,
    pub content_type: Option<String>,
    /// Digest of the bytes we hold locally
    pub local_digest: Option<Digest>,
    /// Digest the origin declares (or the store currently reports)
    pub remote_digest: Option<Digest>,
    /// SHA-256 declared by the index, checked against fetched bytes
    pub sha256: Option<String>,
    pub size: Option<u64>,
    pub remote_size: Option<u64>,
    pub skip: bool,
}

impl WorkItem {
    fn new(key: impl Into<String>, remote_url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            name: None,
            remote_url: Some(remote_url.into()),
            cache_path: None,
            content_type: None,
            local_digest: None,
            remote_digest: None,
            sha256: None,
            size: None,
            remote_size: None,
            skip: false,
        }
    }

    /// Package or source artifact, synced directly by the content pool
    pub fn artifact(key: impl Into<String>, remote_url: impl Into<String>) -> Self {
        Self::new(key, remote_url)
    }

    /// Index file, published through the backup/stage/flip protocol
    pub fn metadata(key: impl Into<String>, remote_url: impl Into<String>) -> Self {
        Self::new(key, remote_url)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_remote_digest(mut self, digest: Digest) -> Self {
        self.remote_digest = Some(digest);
        self
    }

    pub fn with_remote_size(mut self, size: u64) -> Self {
        self.remote_size = Some(size);
        self
    }

    /// Synced iff both digests are known and equal
    pub fn is_synced(&self) -> bool {
        matches!(
            (&self.local_digest, &self.remote_digest),
            (Some(local), Some(remote)) if local == remote
        )
    }

    /// Digest uploads of this item must verify against
    pub fn expected_digest(&self) -> Option<&Digest> {
        self.remote_digest.as_ref().or(self.local_digest.as_ref())
    }

    /// Key with its reserved `+` delimiter spelled every way clients ask for it
    pub fn key_variants(&self) -> Vec<String> {
        key_variants(&self.key)
    }

    /// Safe file-name stem for cache files
    pub fn cache_stem(&self) -> String {
        self.key.replace('/', "_")
    }
}

/// `+` is read as a space by some clients and percent-encoded by others,
/// so keys containing it are stored under all three spellings.
pub fn key_variants(key: &str) -> Vec<String> {
    let mut variants = vec![key.to_string()];
    if key.contains('+') {
        variants.push(key.replace('+', " "));
        variants.push(key.replace('+', "%2B"));
    }
    variants
}

/// Index files of one release, published together
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Release identifier, e.g. `jammy-updates`
    pub release: String,
    pub items: Vec<WorkItem>,
}

impl Batch {
    pub fn new(release: impl Into<String>) -> Self {
        Self {
            release: release.into(),
            items: Vec::new(),
        }
    }

    /// Add an item, replacing any earlier item with the same key. The
    /// replaced item's cache file is removed.
    pub fn push(&mut self, item: WorkItem) {
        let Some(existing) = self.items.iter_mut().find(|existing| existing.key == item.key) else {
            self.items.push(item);
            return;
        };

        let replaced = std::mem::replace(existing, item);
        if let Some(path) = replaced.cache_path.filter(|p| Some(p) != existing.cache_path.as_ref()) {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove replaced cache file");
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn active(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.iter().filter(|item| !item.skip)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackEntry {
    pub original_key: String,
    pub digest: Digest,
}

/// Pre-batch state of every live key a publish is about to overwrite.
/// Lives in memory for one batch attempt only.
#[derive(Debug, Clone, Default)]
pub struct RollbackRecord {
    /// backup key -> original key and its digest at backup time
    pub entries: BTreeMap<String, RollbackEntry>,
    /// Keys that had no live object before this batch
    pub created: Vec<String>,
}

impl RollbackRecord {
    pub fn record(&mut self, backup_key: impl Into<String>, original_key: impl Into<String>, digest: Digest) {
        self.entries.insert(
            backup_key.into(),
            RollbackEntry {
                original_key: original_key.into(),
                digest,
            },
        );
    }

    pub fn record_created(&mut self, key: impl Into<String>) {
        self.created.push(key.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.created.is_empty()
    }
}

pub const STAGING_SUFFIX: &str = "-new";
pub const ROLLBACK_SUFFIX: &str = "-latest";

pub fn staging_key(key: &str) -> String {
    format!("{}{}", key, STAGING_SUFFIX)
}

pub fn rollback_key(key: &str) -> String {
    format!("{}{}", key, ROLLBACK_SUFFIX)
}

pub fn dated_backup_key(key: &str, date: NaiveDate) -> String {
    format!("{}-{}", key, date.format("%Y-%m-%d"))
}

pub const META_DELETE_ORDINAL: &str = "delete_ordinal";
pub const META_DELETE_ON: &str = "delete_on";
pub const META_DELETE_TAGGED_ON: &str = "delete_tagged_on";
pub const META_ORIGINAL_DELETE_ORDINAL: &str = "original_delete_ordinal";

/// Day ordinal with 0001-01-01 as day 1
pub fn day_ordinal(date: NaiveDate) -> i64 {
    use chrono::Datelike;
    i64::from(date.num_days_from_ce())
}

/// Side metadata marking a backup for purge `retain_days` after `today`
pub fn purge_metadata(today: NaiveDate, retain_days: u32) -> HashMap<String, String> {
    let purge_on = today + chrono::Days::new(u64::from(retain_days));
    HashMap::from([
        (META_DELETE_ORDINAL.to_string(), day_ordinal(purge_on).to_string()),
        (META_DELETE_ON.to_string(), purge_on.format("%Y-%m-%d").to_string()),
        (META_DELETE_TAGGED_ON.to_string(), today.format("%Y-%m-%d").to_string()),
    ])
}
