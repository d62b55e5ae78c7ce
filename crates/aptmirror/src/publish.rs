//! Metadata publish coordinator
//!
//! Publishes one release's index files as a unit, one batch at a time:
//!
//! 1. BACKUP: every live key about to change is copied to a dated backup
//!    (tagged for purge) and to a `-latest` rollback key. Keys whose live
//!    digest already matches are skipped.
//! 2. STAGE: new content is uploaded under `-new` keys and verified.
//! 3. FLIP: each `-new` key is copied onto its live key, the fast group
//!    (manifest, signatures, contents) before everything else.
//! 4. ROLLBACK: after a stage or flip failure every backed-up key is restored
//!    from `-latest` and verified against the digest recorded in phase 1.
//!
//! The store has no multi-key transactions, so this is only as atomic as
//! per-key copies allow. The rollback record lives in memory and does not
//! survive a crash mid-batch. Never run two coordinators over overlapping keys.

use crate::content::{remove_cache_file, verify_stored};
use crate::error::{SyncError, SyncResult};
use crate::model::{
    dated_backup_key, purge_metadata, rollback_key, staging_key, Batch, RollbackEntry, RollbackRecord, WorkItem,
};
use crate::retry::{Attempt, RetryPolicy};
use crate::signal::ErrorSignal;
use crate::storage::{Metadata, ObjectStore, PutBody, PutObject};
use aptmirror_common::Digest;
use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Files clients poll first
const FAST_GROUP: &str = r"(^|/)dists/[^/]+/(Release|Release\.gpg|InRelease)$|/Contents-[^/]+\.gz$|Packages\.bz2$";

#[derive(Debug, Clone)]
pub struct PublishSettings {
    /// Budget for backup and stage operations
    pub retry: RetryPolicy,
    /// Budget and linear backoff for flips
    pub flip: RetryPolicy,
    pub backup_days: u32,
    /// Date stamped on backups
    pub today: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Published,
    /// Every index file already matched the live copy
    Unchanged,
    /// Backup failed; nothing was staged or flipped
    Aborted { error: String },
    /// Stage or flip failed and every backed-up key was restored
    RolledBack { error: String },
    /// Rollback could not restore the prior state
    Corrupt { error: String, detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub release: String,
    pub outcome: BatchOutcome,
    pub flipped: Vec<String>,
    pub skipped: usize,
    pub restored: Vec<String>,
}

impl BatchReport {
    fn new(release: &str) -> Self {
        Self {
            release: release.to_string(),
            outcome: BatchOutcome::Unchanged,
            flipped: Vec::new(),
            skipped: 0,
            restored: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, BatchOutcome::Published | BatchOutcome::Unchanged)
    }
}

pub struct MetadataPublisher {
    store: Arc<dyn ObjectStore>,
    signal: ErrorSignal,
    settings: PublishSettings,
    fast: Regex,
}

impl MetadataPublisher {
    pub fn new(store: Arc<dyn ObjectStore>, signal: ErrorSignal, settings: PublishSettings) -> SyncResult<Self> {
        let fast = Regex::new(FAST_GROUP).map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(Self {
            store,
            signal,
            settings,
            fast,
        })
    }

    /// Publish one batch end to end. Failures raise the error signal and are
    /// reported in the returned outcome.
    #[instrument(skip(self, batch), fields(release = %batch.release, items = batch.len()))]
    pub async fn publish(&self, mut batch: Batch) -> BatchReport {
        info!("Publishing metadata batch");
        let mut report = BatchReport::new(&batch.release);
        let mut record = RollbackRecord::default();

        let outcome = self.run_phases(&mut batch, &mut record, &mut report).await;
        report.outcome = outcome;

        for item in &batch.items {
            remove_cache_file(item).await;
        }

        match &report.outcome {
            BatchOutcome::Published => info!(flipped = report.flipped.len(), skipped = report.skipped, "Batch published"),
            BatchOutcome::Unchanged => info!(skipped = report.skipped, "Batch unchanged"),
            BatchOutcome::Aborted { error } | BatchOutcome::RolledBack { error } | BatchOutcome::Corrupt { error, .. } => {
                self.signal
                    .raise(format!("metadata batch {} failed: {}", batch.release, error));
            },
        }

        report
    }

    async fn run_phases(
        &self,
        batch: &mut Batch,
        record: &mut RollbackRecord,
        report: &mut BatchReport,
    ) -> BatchOutcome {
        info!("Starting backup of metadata");
        if let Err(e) = self.backup(batch, record).await {
            error!(error = %e, "Metadata backup failed, nothing was staged");
            return BatchOutcome::Aborted { error: e.to_string() };
        }

        report.skipped = batch.items.iter().filter(|i| i.skip).count();
        let active: Vec<&WorkItem> = batch.active().collect();
        if active.is_empty() {
            return BatchOutcome::Unchanged;
        }

        info!(count = active.len(), "Staging new metadata");
        let failure = match self.stage(&active).await {
            Err(e) => Some(e),
            Ok(()) => {
                info!("Activating new metadata");
                self.flip(&active, &mut report.flipped).await.err()
            },
        };

        let Some(failure) = failure else {
            self.remove_staging(&active).await;
            return BatchOutcome::Published;
        };

        error!(error = %failure, flipped = report.flipped.len(), "Publish failed, rolling back");
        match self.rollback(&batch.release, record).await {
            Ok(restored) => {
                report.restored = restored;
                BatchOutcome::RolledBack {
                    error: failure.to_string(),
                }
            },
            Err((detail, restored)) => {
                report.restored = restored;
                BatchOutcome::Corrupt {
                    error: failure.to_string(),
                    detail,
                }
            },
        }
    }

    // ------------------------------------------------------------------
    // Phase 1
    // ------------------------------------------------------------------

    async fn backup(&self, batch: &mut Batch, record: &mut RollbackRecord) -> SyncResult<()> {
        for item in batch.items.iter_mut() {
            if item.local_digest.is_none() {
                let path = item
                    .cache_path
                    .as_deref()
                    .ok_or_else(|| SyncError::Config(format!("{} has no cached content", item.key)))?;
                item.local_digest = Some(Digest::from_file(path).await?);
            }
            self.backup_item(item, record).await?;
        }
        Ok(())
    }

    async fn backup_item(&self, item: &mut WorkItem, record: &mut RollbackRecord) -> SyncResult<()> {
        let owned_key = item.key.clone();
        let key = owned_key.as_str();
        let store = self.store.as_ref();

        let live = self
            .settings
            .retry
            .run(&format!("inspect {}", key), &self.signal, |_| async move {
                Attempt::from_result(store.get(key).await)
            })
            .await?;

        let Some(live) = live else {
            debug!(key = %key, "New metadata file, no backup needed");
            record.record_created(key);
            return Ok(());
        };

        let local = item.local_digest.clone();
        if local.as_ref().is_some_and(|d| live.matches(d)) {
            debug!(key = %key, "Live copy already current");
            item.skip = true;
            item.remote_digest = live.digest;
            return Ok(());
        }

        let live_digest = live
            .digest
            .ok_or_else(|| SyncError::store(key, "live object has no content digest to restore against"))?;
        item.remote_digest = Some(live_digest.clone());

        let dated = dated_backup_key(key, self.settings.today);
        let latest = rollback_key(key);
        let metadata = purge_metadata(self.settings.today, self.settings.backup_days);
        let (dated_ref, latest_ref, metadata_ref, digest_ref) = (&dated, &latest, &metadata, &live_digest);

        self.settings
            .retry
            .run(&format!("backup {}", key), &self.signal, |_| async move {
                Attempt::from_result(
                    async {
                        store.copy(key, dated_ref, Some(metadata_ref), false).await?;
                        store.copy(key, latest_ref, Some(metadata_ref), false).await?;
                        verify_stored(store, latest_ref, digest_ref).await
                    }
                    .await,
                )
            })
            .await?;

        debug!(key = %key, backup = %latest, dated = %dated, "Backed up live metadata");
        record.record(latest, owned_key, live_digest);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 2
    // ------------------------------------------------------------------

    async fn stage(&self, items: &[&WorkItem]) -> SyncResult<()> {
        let store = self.store.as_ref();

        for item in items {
            let (Some(path), Some(local)) = (item.cache_path.as_ref(), item.local_digest.as_ref()) else {
                return Err(SyncError::Config(format!("{} has no cached content", item.key)));
            };
            let staged_key = staging_key(&item.key);
            let staged = staged_key.as_str();

            self.settings
                .retry
                .run(&format!("stage {}", staged), &self.signal, |_| async move {
                    let object = PutObject::new(PutBody::File(path.clone()))
                        .content_type(item.content_type.clone())
                        .content_md5(Some(local.clone()));

                    Attempt::from_result(
                        async {
                            store.put(staged, object).await?;
                            verify_stored(store, staged, local).await
                        }
                        .await,
                    )
                })
                .await?;

            debug!(key = %staged, "Staged");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 3
    // ------------------------------------------------------------------

    async fn flip(&self, items: &[&WorkItem], flipped: &mut Vec<String>) -> SyncResult<()> {
        let (fast, slow): (Vec<&WorkItem>, Vec<&WorkItem>) =
            items.iter().copied().partition(|item| self.fast.is_match(&item.key));

        debug!(fast = fast.len(), slow = slow.len(), "Flip groups");

        for item in fast.iter().chain(slow.iter()) {
            self.flip_item(item).await?;
            flipped.push(item.key.clone());
        }

        info!(flipped = flipped.len(), "Finished flipping metadata active");
        Ok(())
    }

    async fn flip_item(&self, item: &WorkItem) -> SyncResult<()> {
        let store = self.store.as_ref();
        let staged_key = staging_key(&item.key);
        let staged = staged_key.as_str();
        let local = item
            .local_digest
            .as_ref()
            .ok_or_else(|| SyncError::Config(format!("{} has no local digest", item.key)))?;

        self.settings
            .flip
            .run(&format!("flip {}", item.key), &self.signal, |_| async move {
                Attempt::from_result(
                    async {
                        store.copy(staged, &item.key, None, false).await?;
                        verify_stored(store, &item.key, local).await
                    }
                    .await,
                )
            })
            .await?;

        debug!(key = %item.key, "Flipped");
        Ok(())
    }

    async fn remove_staging(&self, items: &[&WorkItem]) {
        for item in items {
            let staged = staging_key(&item.key);
            if let Err(e) = self.store.delete(&staged).await {
                warn!(key = %staged, error = %e, "Unable to remove staging key");
            }
        }
    }

    // ------------------------------------------------------------------
    // Phase 4
    // ------------------------------------------------------------------

    /// Restore every recorded key. `Err` carries what could not be restored.
    async fn rollback(&self, release: &str, record: &RollbackRecord) -> Result<Vec<String>, (String, Vec<String>)> {
        let mut restored = Vec::new();
        let mut failures = Vec::new();

        for (backup_key, entry) in &record.entries {
            match self.restore(backup_key, entry).await {
                Ok(true) => {
                    warn!(key = %entry.original_key, "Restored key from rollback backup");
                    restored.push(entry.original_key.clone());
                },
                Ok(false) => debug!(key = %entry.original_key, "Key untouched, no restore needed"),
                Err(e) => {
                    error!(
                        severity = "corrupt",
                        batch = %release,
                        key = %entry.original_key,
                        backup = %backup_key,
                        error = %e,
                        "Rollback failed, mirror is corrupt"
                    );
                    failures.push(format!("{}: {}", entry.original_key, e));
                },
            }
        }

        for key in &record.created {
            if let Err(e) = self.store.delete(key).await {
                warn!(key = %key, error = %e, "Unable to remove key created by failed batch");
            }
        }

        if failures.is_empty() {
            info!(batch = %release, restored = restored.len(), "Rollback succeeded");
            Ok(restored)
        } else {
            Err((failures.join("; "), restored))
        }
    }

    /// `Ok(true)` when the key had to be copied back
    async fn restore(&self, backup_key: &str, entry: &RollbackEntry) -> SyncResult<bool> {
        let store = self.store.as_ref();
        let key = entry.original_key.as_str();
        // Rollback runs to completion even though the run is already failing
        let uncancelled = ErrorSignal::new();

        let backup = self
            .settings
            .retry
            .run(&format!("inspect {}", backup_key), &uncancelled, |_| async move {
                Attempt::from_result(store.get(backup_key).await)
            })
            .await?;
        if backup.is_none() {
            return Err(SyncError::CorruptMirror {
                key: key.to_string(),
                message: format!("rollback backup {} is missing", backup_key),
            });
        }

        let live = self
            .settings
            .retry
            .run(&format!("inspect {}", key), &uncancelled, |_| async move {
                Attempt::from_result(store.get(key).await)
            })
            .await?;
        if live.is_some_and(|info| info.matches(&entry.digest)) {
            return Ok(false);
        }

        let metadata = Metadata::new();
        let metadata = &metadata;
        self.settings
            .retry
            .run(&format!("restore {}", key), &uncancelled, |_| async move {
                Attempt::from_result(store.copy(backup_key, key, Some(metadata), false).await)
            })
            .await?;

        verify_stored(store, key, &entry.digest)
            .await
            .map_err(|e| SyncError::CorruptMirror {
                key: key.to_string(),
                message: format!("restored content does not verify: {}", e),
            })?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::storage::MemoryStore;

    #[test]
    fn test_fast_group() {
        let fast = Regex::new(FAST_GROUP).unwrap();
        assert!(fast.is_match("ubuntu/dists/jammy/Release"));
        assert!(fast.is_match("ubuntu/dists/jammy/Release.gpg"));
        assert!(fast.is_match("ubuntu/dists/jammy/InRelease"));
        assert!(fast.is_match("ubuntu/dists/jammy/Contents-amd64.gz"));
        assert!(fast.is_match("ubuntu/dists/jammy/main/binary-amd64/Packages.bz2"));
        assert!(!fast.is_match("ubuntu/dists/jammy/main/binary-amd64/Packages.gz"));
        assert!(fast.is_match("dists/jammy/Release"));
        assert!(!fast.is_match("ubuntu/dists/jammy/main/binary-amd64/Release"));
    }

    #[tokio::test]
    async fn test_rollback_reports_missing_backup_as_corrupt() {
        let store = MemoryStore::new();
        store.insert("dists/jammy/Release", "changed");

        let publisher = MetadataPublisher::new(
            Arc::new(store.clone()),
            ErrorSignal::new(),
            PublishSettings {
                retry: RetryPolicy::new(2, Backoff::None),
                flip: RetryPolicy::new(2, Backoff::None),
                backup_days: 3,
                today: NaiveDate::from_ymd_opt(2026, 10, 16).unwrap(),
            },
        )
        .unwrap();

        let mut record = RollbackRecord::default();
        record.record(
            "dists/jammy/Release-latest",
            "dists/jammy/Release",
            Digest::of_bytes(b"original"),
        );

        let (detail, restored) = publisher.rollback("jammy", &record).await.unwrap_err();
        assert!(detail.contains("is missing"));
        assert!(restored.is_empty());
    }
}
