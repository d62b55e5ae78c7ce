//! Content sync worker pool
//!
//! Workers drain the artifact queue. For each item they read every key
//! variant from the store. When all variants already carry the expected
//! digest the item is skipped, and when only some do the rest are copied from
//! a good one inside the store. Otherwise the artifact is uploaded, re-read
//! and verified, and copied to each alternate key spelling. Artifacts without
//! a cache file are streamed from the origin into a spool file, hashed on the
//! way through, so memory use stays flat however large the package.
//!
//! An item that exhausts its retry budget raises the error signal. Sibling
//! workers finish the item they hold and then stop taking work.

use crate::error::{SyncError, SyncResult};
use crate::model::{WorkItem, META_DELETE_ORDINAL, META_ORIGINAL_DELETE_ORDINAL};
use crate::origin::{check_status, Origin};
use crate::queue::WorkQueue;
use crate::retry::{Attempt, RetryPolicy};
use crate::signal::ErrorSignal;
use crate::storage::{Metadata, ObjectStore, PutBody, PutObject, StoreConnector, StoreHandle};
use aptmirror_common::checksum::StreamingDigest;
use aptmirror_common::Digest;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Terminal state of one artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentOutcome {
    Uploaded,
    /// Every key variant already matched
    Skipped,
    /// Missing or stale variants were copied from a matching one
    Repaired,
    /// Origin reported the artifact absent
    Excluded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContentStats {
    pub uploaded: usize,
    pub skipped: usize,
    pub repaired: usize,
    pub excluded: usize,
    pub failed: usize,
}

impl ContentStats {
    fn record(&mut self, outcome: ContentOutcome) {
        match outcome {
            ContentOutcome::Uploaded => self.uploaded += 1,
            ContentOutcome::Skipped => self.skipped += 1,
            ContentOutcome::Repaired => self.repaired += 1,
            ContentOutcome::Excluded => self.excluded += 1,
        }
    }

    fn merge(&mut self, other: ContentStats) {
        self.uploaded += other.uploaded;
        self.skipped += other.skipped;
        self.repaired += other.repaired;
        self.excluded += other.excluded;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone)]
pub struct ContentSettings {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub recycle_after: u32,
    /// Where artifacts streamed from the origin are held until uploaded
    pub spool_dir: PathBuf,
}

pub struct ContentSyncPool {
    handles: Vec<JoinHandle<ContentStats>>,
}

impl ContentSyncPool {
    /// Spawn `settings.workers` workers on `queue`
    pub fn start(
        settings: ContentSettings,
        connector: Arc<dyn StoreConnector>,
        origin: Arc<dyn Origin>,
        queue: Arc<WorkQueue<WorkItem>>,
        signal: ErrorSignal,
    ) -> Self {
        let handles = (0..settings.workers.max(1))
            .map(|id| {
                let worker = ContentWorker {
                    id,
                    store: StoreHandle::new(connector.clone(), settings.recycle_after),
                    origin: origin.clone(),
                    queue: queue.clone(),
                    signal: signal.clone(),
                    retry: settings.retry,
                    spool_dir: settings.spool_dir.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(workers = settings.workers, "Content sync pool started");
        Self { handles }
    }

    /// Wait for every worker to exit. The queue must be closed first or
    /// the error signal raised, otherwise idle workers wait forever.
    pub async fn finish(self) -> ContentStats {
        let mut stats = ContentStats::default();
        for result in futures::future::join_all(self.handles).await {
            match result {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(e) => error!(error = %e, "Content worker panicked"),
            }
        }

        info!(
            uploaded = stats.uploaded,
            skipped = stats.skipped,
            repaired = stats.repaired,
            excluded = stats.excluded,
            failed = stats.failed,
            "Content sync pool finished"
        );
        stats
    }
}

struct ContentWorker {
    id: usize,
    store: StoreHandle,
    origin: Arc<dyn Origin>,
    queue: Arc<WorkQueue<WorkItem>>,
    signal: ErrorSignal,
    retry: RetryPolicy,
    spool_dir: PathBuf,
}

impl ContentWorker {
    async fn run(mut self) -> ContentStats {
        let mut stats = ContentStats::default();

        while let Some(item) = self.queue.pop_unless(&self.signal).await {
            let result = match self.store.acquire().await {
                Ok(store) => {
                    let target = SyncTarget {
                        store: store.as_ref(),
                        origin: self.origin.as_ref(),
                        spool_dir: &self.spool_dir,
                    };
                    sync_item(&target, &item, &self.retry, &self.signal).await
                },
                Err(e) => Err(e),
            };

            remove_cache_file(&item).await;

            match result {
                Ok(outcome) => stats.record(outcome),
                Err(SyncError::Cancelled(reason)) => {
                    debug!(worker = self.id, key = %item.key, reason = %reason, "Abandoned item");
                },
                Err(e) => {
                    stats.failed += 1;
                    self.store.reset();
                    error!(worker = self.id, key = %item.key, error = %e, "Artifact sync failed");
                    self.signal.raise(format!("artifact {} failed: {}", item.key, e));
                },
            }

            self.queue.task_done();
        }

        if self.signal.is_raised() {
            warn!(worker = self.id, "Content worker stopping on error signal");
        } else {
            debug!(worker = self.id, "Content worker finished");
        }
        stats
    }
}

/// Where one artifact is reconciled
#[derive(Clone, Copy)]
pub struct SyncTarget<'a> {
    pub store: &'a dyn ObjectStore,
    pub origin: &'a dyn Origin,
    pub spool_dir: &'a Path,
}

/// Reconcile one artifact with the store under `retry`
pub async fn sync_item(
    target: &SyncTarget<'_>,
    item: &WorkItem,
    retry: &RetryPolicy,
    signal: &ErrorSignal,
) -> SyncResult<ContentOutcome> {
    retry
        .run(&format!("sync {}", item.key), signal, |attempt| async move {
            Attempt::from_result(sync_attempt(target, item, attempt).await)
        })
        .await
}

async fn sync_attempt(target: &SyncTarget<'_>, item: &WorkItem, attempt: u32) -> SyncResult<ContentOutcome> {
    let store = target.store;

    if let Some(expected) = item.expected_digest() {
        let variants = check_variants(store, item, expected).await?;
        if variants.stale.is_empty() {
            debug!(key = %item.key, "Already in sync");
            return Ok(ContentOutcome::Skipped);
        }
        if let Some(source) = &variants.good {
            repair_variants(store, source, &variants.stale, expected).await?;
            return Ok(ContentOutcome::Repaired);
        }
    }

    debug!(key = %item.key, attempt, "Uploading");

    match &item.cache_path {
        Some(path) => {
            let digest = match item.expected_digest() {
                Some(digest) => digest.clone(),
                None => Digest::from_file(path).await?,
            };
            let object = PutObject::new(PutBody::File(path.clone()))
                .content_type(item.content_type.clone())
                .content_md5(Some(digest.clone()));
            upload(store, item, object, &digest).await
        },
        None => {
            let Some(spooled) = spool(target, item).await? else {
                return Ok(ContentOutcome::Excluded);
            };
            let object = PutObject::new(PutBody::File(spooled.path.clone()))
                .content_type(spooled.content_type.clone())
                .content_md5(Some(spooled.digest.clone()));

            let result = upload(store, item, object, &spooled.digest).await;
            remove_file(&spooled.path).await;
            result
        },
    }
}

async fn upload(store: &dyn ObjectStore, item: &WorkItem, object: PutObject, expected: &Digest) -> SyncResult<ContentOutcome> {
    store.put(&item.key, object).await?;
    verify_stored(store, &item.key, expected).await?;

    for variant in item.key_variants().iter().skip(1) {
        store.copy(&item.key, variant, None, false).await?;
        verify_stored(store, variant, expected).await?;
        debug!(key = %item.key, variant = %variant, "Wrote alternate key spelling");
    }

    info!(key = %item.key, digest = %expected, "Uploaded artifact");
    Ok(ContentOutcome::Uploaded)
}

#[derive(Debug, Default)]
struct VariantCheck {
    /// A variant already holding the expected content
    good: Option<String>,
    /// Variants that are missing or hold something else
    stale: Vec<String>,
}

/// Sort key variants into good and stale. Good variants carrying a purge
/// tag are rewritten without it.
async fn check_variants(store: &dyn ObjectStore, item: &WorkItem, expected: &Digest) -> SyncResult<VariantCheck> {
    let mut check = VariantCheck::default();

    for variant in item.key_variants() {
        match store.get(&variant).await? {
            Some(info) if info.matches(expected) => {
                if let Some(ordinal) = info.metadata.get(META_DELETE_ORDINAL) {
                    let metadata = Metadata::from([(META_ORIGINAL_DELETE_ORDINAL.to_string(), ordinal.clone())]);
                    store.copy(&variant, &variant, Some(&metadata), true).await?;
                    info!(key = %variant, "Prevented live artifact from being purged");
                }
                check.good.get_or_insert(variant);
            },
            Some(_) => {
                debug!(key = %variant, "Stored digest differs");
                check.stale.push(variant);
            },
            None => check.stale.push(variant),
        }
    }

    Ok(check)
}

async fn repair_variants(store: &dyn ObjectStore, source: &str, stale: &[String], expected: &Digest) -> SyncResult<()> {
    for variant in stale {
        store.copy(source, variant, None, false).await?;
        verify_stored(store, variant, expected).await?;
        info!(key = %variant, source = %source, "Repaired key spelling from stored copy");
    }
    Ok(())
}

/// An artifact held on local disk after a verified download
struct Spooled {
    path: PathBuf,
    digest: Digest,
    content_type: Option<String>,
}

/// Stream an artifact from the origin into the spool directory, checking
/// size and digests as the bytes pass. `Ok(None)` when absent upstream.
async fn spool(target: &SyncTarget<'_>, item: &WorkItem) -> SyncResult<Option<Spooled>> {
    let url = item
        .remote_url
        .as_deref()
        .ok_or_else(|| SyncError::Config(format!("{} has neither cache file nor URL", item.key)))?;

    let response = target.origin.stream(url).await?;
    match check_status(url, response.status) {
        Attempt::Done(true) => {},
        Attempt::Done(false) => return Ok(None),
        Attempt::Retry(e) | Attempt::Fatal(e) => return Err(e),
    }

    tokio::fs::create_dir_all(target.spool_dir).await?;
    let path = target
        .spool_dir
        .join(format!("{}-{}", item.cache_stem(), Uuid::new_v4().simple()));

    let written = write_spool(response.body, &path).await;
    match written.and_then(|hasher| verify_streamed(item, response.content_length, hasher)) {
        Ok(digest) => {
            debug!(key = %item.key, path = %path.display(), "Spooled artifact");
            Ok(Some(Spooled {
                path,
                digest,
                content_type: response.content_type,
            }))
        },
        Err(e) => {
            remove_file(&path).await;
            Err(e)
        },
    }
}

async fn write_spool(
    mut body: BoxStream<'static, SyncResult<Bytes>>,
    path: &Path,
) -> SyncResult<StreamingDigest> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = StreamingDigest::new();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    Ok(hasher)
}

/// Integrity of bytes streamed from the origin. Returns their MD5.
fn verify_streamed(item: &WorkItem, content_length: Option<u64>, hasher: StreamingDigest) -> SyncResult<Digest> {
    let size = hasher.consumed();
    for expected in [content_length, item.remote_size].into_iter().flatten() {
        if expected != size {
            return Err(SyncError::SizeMismatch {
                key: item.key.clone(),
                expected,
                actual: size,
            });
        }
    }

    let (md5, sha256) = hasher.finish();
    if let Some(expected) = &item.remote_digest {
        if *expected != md5 {
            return Err(SyncError::digest_mismatch(&item.key, expected, &md5));
        }
    }

    if let Some(expected) = &item.sha256 {
        if !expected.eq_ignore_ascii_case(&sha256) {
            return Err(SyncError::digest_mismatch(&item.key, expected, &sha256));
        }
    }

    Ok(md5)
}

pub(crate) async fn verify_stored(store: &dyn ObjectStore, key: &str, expected: &Digest) -> SyncResult<()> {
    let info = store
        .get(key)
        .await?
        .ok_or_else(|| SyncError::store(key, "object missing right after upload"))?;

    match &info.digest {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(SyncError::digest_mismatch(key, expected, actual)),
        None => Err(SyncError::digest_mismatch(key, expected, "<no content digest>")),
    }
}

/// Cache files belong to the worker that consumed them and go away
/// whatever the outcome
pub(crate) async fn remove_cache_file(item: &WorkItem) {
    if let Some(path) = &item.cache_path {
        remove_file(path).await;
    }
}

async fn remove_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove cache file");
        }
    }
}
