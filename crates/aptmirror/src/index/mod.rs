//! Repository index parsing
//!
//! A distribution is parsed in two stages. The top-level `Release` manifest
//! is fetched first and its MD5 section, filtered by [`PathFilter`], becomes
//! the index queue. Index workers then download every listed index file to the
//! local cache, verify it against the manifest, expand package and source
//! lists into artifact work items and translation indices into more metadata
//! items. Every index file ends up in the distribution's [`Batch`] for the
//! publish coordinator.

use crate::error::{SyncError, SyncResult};
use crate::model::{Batch, WorkItem};
use crate::origin::{classify, Fetched, Origin, OriginResponse};
use crate::queue::WorkQueue;
use crate::retry::{Attempt, RetryPolicy};
use crate::signal::ErrorSignal;
use aptmirror_common::Digest;
use bytes::Bytes;
use flate2::read::GzDecoder;
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod locale;
pub mod packages;
pub mod release;
pub mod sources;

pub use release::{parse_manifest, ManifestEntry, PathFilter};

/// Detached signatures published beside `Release`; both are optional upstream
const SIGNATURES: [&str; 2] = ["Release.gpg", "InRelease"];

/// Where list entries resolve to
#[derive(Debug, Clone, Copy)]
pub struct ListContext<'a> {
    pub origin_base: &'a str,
    pub dest_prefix: &'a str,
    /// Index file being parsed, for log context
    pub source_name: &'a str,
}

#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub items: Vec<WorkItem>,
    /// Records skipped as malformed
    pub dropped: usize,
}

/// Feed every line of `reader` to `f` without its terminator.
///
/// Lines that are not valid UTF-8 are decoded lossily and flagged, so a
/// stray latin-1 byte costs at most the record it sits in. Only a failing
/// reader (truncated or corrupt gzip) fails the whole list.
pub(crate) fn for_each_line<R: BufRead>(
    mut reader: R,
    source_name: &str,
    mut f: impl FnMut(&str, bool),
) -> SyncResult<()> {
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        let read = reader
            .read_until(b'\n', &mut buffer)
            .map_err(|e| SyncError::MalformedRecord {
                source_name: source_name.to_string(),
                message: e.to_string(),
            })?;
        if read == 0 {
            return Ok(());
        }

        while matches!(buffer.last(), Some(b'\n' | b'\r')) {
            buffer.pop();
        }

        match std::str::from_utf8(&buffer) {
            Ok(line) => f(line, false),
            Err(_) => f(&String::from_utf8_lossy(&buffer), true),
        }
    }
}

/// Join a base and a relative path with exactly one `/`
pub fn join(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    if base.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[derive(Debug, Clone)]
pub struct IndexSettings {
    /// Repository root on the origin, e.g. `http://archive.ubuntu.com/ubuntu`
    pub origin_base: String,
    pub dest_prefix: String,
    pub cache_dir: PathBuf,
    pub workers: usize,
    pub retry: RetryPolicy,
}

/// Counters for one distribution
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct IndexStats {
    pub index_files: usize,
    pub artifacts: usize,
    pub excluded: usize,
    pub dropped: usize,
}

impl IndexStats {
    pub fn merge(&mut self, other: IndexStats) {
        self.index_files += other.index_files;
        self.artifacts += other.artifacts;
        self.excluded += other.excluded;
        self.dropped += other.dropped;
    }
}

/// Result of parsing one distribution
#[derive(Debug)]
pub struct DistIndex {
    pub batch: Batch,
    pub stats: IndexStats,
}

/// A verified download sitting in the cache directory
struct Cached {
    path: PathBuf,
    digest: Digest,
    size: u64,
    content_type: Option<String>,
    body: Bytes,
}

impl Cached {
    fn apply(&self, item: &mut WorkItem) {
        item.cache_path = Some(self.path.clone());
        item.local_digest = Some(self.digest.clone());
        item.size = Some(self.size);
        item.content_type = self.content_type.clone();
    }
}

#[derive(Debug, Clone, Copy)]
enum ListKind {
    Packages,
    Sources,
}

#[derive(Clone)]
pub struct IndexParser {
    origin: Arc<dyn Origin>,
    artifacts: Arc<WorkQueue<WorkItem>>,
    signal: ErrorSignal,
    settings: Arc<IndexSettings>,
    filter: Arc<PathFilter>,
}

impl IndexParser {
    pub fn new(
        origin: Arc<dyn Origin>,
        artifacts: Arc<WorkQueue<WorkItem>>,
        signal: ErrorSignal,
        settings: IndexSettings,
        filter: PathFilter,
    ) -> Self {
        Self {
            origin,
            artifacts,
            signal,
            settings: Arc::new(settings),
            filter: Arc::new(filter),
        }
    }

    /// Parse one distribution, pushing its artifacts onto the artifact queue
    /// and returning its index files as a batch.
    ///
    /// A manifest that cannot be fetched raises the error signal.
    pub async fn parse_dist(&self, dist: &str) -> SyncResult<DistIndex> {
        let result = self.parse_dist_inner(dist).await;
        if let Err(e) = &result {
            self.signal.raise(format!("index parse of {} failed: {}", dist, e));
        }
        result
    }

    async fn parse_dist_inner(&self, dist: &str) -> SyncResult<DistIndex> {
        let dist_path = format!("dists/{}", dist);
        let mut batch = Batch::new(dist);
        let mut stats = IndexStats::default();

        let mut release = self.metadata_item(&join(&dist_path, "Release"), "Release");
        let cached = self.fetch_cached(&release).await?.ok_or_else(|| {
            SyncError::Config(format!("{} is not published upstream", dist_path))
        })?;
        cached.apply(&mut release);

        let manifest = String::from_utf8_lossy(&cached.body).into_owned();
        batch.push(release);
        stats.index_files += 1;

        for name in SIGNATURES {
            let mut signature = self.metadata_item(&join(&dist_path, name), name);
            match self.fetch_cached(&signature).await? {
                Some(cached) => {
                    cached.apply(&mut signature);
                    batch.push(signature);
                    stats.index_files += 1;
                },
                None => debug!(dist = %dist, name, "No signature upstream"),
            }
        }

        let entries = parse_manifest(&manifest, &join(&dist_path, "Release"));
        let index_queue = Arc::new(WorkQueue::new(format!("index:{}", dist)));
        for entry in entries.into_iter().filter(|e| self.filter.accepts(&e.path)) {
            let item = self
                .metadata_item(&join(&dist_path, &entry.path), &entry.path)
                .with_remote_digest(entry.digest)
                .with_remote_size(entry.size);
            index_queue.push(item).map_err(|e| SyncError::Cancelled(e.to_string()))?;
        }
        index_queue.close();

        info!(
            dist = %dist,
            index_files = index_queue.outstanding(),
            "Parsed manifest, starting index workers"
        );

        let batch = Arc::new(Mutex::new(batch));
        let workers = (0..self.settings.workers.max(1)).map(|id| {
            let parser = self.clone();
            let queue = index_queue.clone();
            let batch = batch.clone();
            tokio::spawn(async move { parser.run_index_worker(id, queue, batch).await })
        });

        for result in futures::future::join_all(workers).await {
            match result {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(e) => self.signal.raise(format!("index worker panicked: {}", e)),
            }
        }

        if let Some(reason) = self.signal.reason() {
            return Err(SyncError::Cancelled(reason.to_string()));
        }

        let batch = std::mem::take(&mut *batch.lock().unwrap_or_else(|e| e.into_inner()));
        info!(
            dist = %dist,
            index_files = batch.len(),
            artifacts = stats.artifacts,
            excluded = stats.excluded,
            dropped = stats.dropped,
            "Finished parsing distribution"
        );

        Ok(DistIndex { batch, stats })
    }

    async fn run_index_worker(
        &self,
        id: usize,
        queue: Arc<WorkQueue<WorkItem>>,
        batch: Arc<Mutex<Batch>>,
    ) -> IndexStats {
        let mut stats = IndexStats::default();

        while let Some(item) = queue.pop_unless(&self.signal).await {
            let key = item.key.clone();
            match self.process_index(item, &mut stats).await {
                Ok(items) => {
                    let mut batch = batch.lock().unwrap_or_else(|e| e.into_inner());
                    for item in items {
                        batch.push(item);
                    }
                },
                Err(e) => {
                    error!(worker = id, key = %key, error = %e, "Index file failed");
                    self.signal.raise(format!("index file {} failed: {}", key, e));
                },
            }
            queue.task_done();
        }

        debug!(worker = id, "Index worker finished");
        stats
    }

    /// Download, verify and expand one index file. Returns the metadata items
    /// it contributes to the batch.
    async fn process_index(&self, mut item: WorkItem, stats: &mut IndexStats) -> SyncResult<Vec<WorkItem>> {
        let Some(cached) = self.fetch_cached(&item).await? else {
            stats.excluded += 1;
            return Ok(Vec::new());
        };
        cached.apply(&mut item);
        stats.index_files += 1;

        let mut items = Vec::new();
        let list_kind = if item.key.ends_with("/Packages.gz") {
            Some(ListKind::Packages)
        } else if item.key.ends_with("/Sources.gz") {
            Some(ListKind::Sources)
        } else {
            None
        };

        if let Some(kind) = list_kind {
            match self.parse_list(&item.key, cached.path.clone(), kind).await {
                Ok(outcome) => {
                    stats.dropped += outcome.dropped;
                    stats.artifacts += outcome.items.len();
                    for artifact in outcome.items {
                        self.artifacts
                            .push(artifact)
                            .map_err(|e| SyncError::Cancelled(e.to_string()))?;
                    }
                },
                // A list whose artifacts were not all queued must not go live
                Err(e) => {
                    warn!(key = %item.key, error = %e, "Could not parse list");
                    return Err(e);
                },
            }
        } else if item.key.ends_with("/i18n/Index") {
            items.extend(self.fetch_translations(&item, &cached.body, stats).await?);
        }

        items.push(item);
        Ok(items)
    }

    async fn parse_list(&self, source_name: &str, path: PathBuf, kind: ListKind) -> SyncResult<ParseOutcome> {
        let origin_base = self.settings.origin_base.clone();
        let dest_prefix = self.settings.dest_prefix.clone();
        let source = source_name.to_string();

        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            let reader = BufReader::new(GzDecoder::new(file));
            let ctx = ListContext {
                origin_base: &origin_base,
                dest_prefix: &dest_prefix,
                source_name: &source,
            };

            match kind {
                ListKind::Packages => packages::parse_packages(reader, &ctx),
                ListKind::Sources => sources::parse_sources(reader, &ctx),
            }
        })
        .await
        .map_err(|e| SyncError::MalformedRecord {
            source_name: source_name.to_string(),
            message: format!("parser task failed: {}", e),
        })?
    }

    /// Translation files are fetched here, synchronously, so they reach the
    /// batch with a local digest already computed.
    async fn fetch_translations(
        &self,
        index: &WorkItem,
        body: &[u8],
        stats: &mut IndexStats,
    ) -> SyncResult<Vec<WorkItem>> {
        let Some(index_url) = index.remote_url.as_deref() else {
            return Ok(Vec::new());
        };
        let key_base = locale::locale_base(&index.key);
        let url_base = locale::locale_base(index_url);

        let content = String::from_utf8_lossy(body);
        let mut items = Vec::new();

        for entry in locale::parse_locale_index(&content, &index.key) {
            let mut item = WorkItem::metadata(join(key_base, &entry.name), join(url_base, &entry.name))
                .with_name(entry.name.clone())
                .with_remote_size(entry.size);

            match self.fetch_cached(&item).await? {
                Some(cached) => {
                    cached.apply(&mut item);
                    items.push(item);
                },
                None => stats.excluded += 1,
            }
        }

        stats.index_files += items.len();
        debug!(key = %index.key, translations = items.len(), "Fetched translations");
        Ok(items)
    }

    fn metadata_item(&self, path: &str, name: &str) -> WorkItem {
        WorkItem::metadata(
            join(&self.settings.dest_prefix, path),
            join(&self.settings.origin_base, path),
        )
        .with_name(name)
    }

    /// Fetch an item into the cache, verifying it against any declared size
    /// and digest. `Ok(None)` when the origin reports it absent.
    async fn fetch_cached(&self, item: &WorkItem) -> SyncResult<Option<Cached>> {
        let url = item
            .remote_url
            .as_deref()
            .ok_or_else(|| SyncError::Config(format!("{} has no origin URL", item.key)))?;

        self.settings
            .retry
            .run(&format!("fetch {}", url), &self.signal, |_| async move {
                let response = match self.origin.get(url).await {
                    Ok(response) => response,
                    Err(e) => return Attempt::from_result(Err(e)),
                };

                match classify(url, response) {
                    Attempt::Done(Fetched::Found(response)) => {
                        Attempt::from_result(self.write_cache(item, response).await.map(Some))
                    },
                    Attempt::Done(Fetched::Absent) => Attempt::Done(None),
                    Attempt::Retry(e) => Attempt::Retry(e),
                    Attempt::Fatal(e) => Attempt::Fatal(e),
                }
            })
            .await
    }

    async fn write_cache(&self, item: &WorkItem, response: OriginResponse) -> SyncResult<Cached> {
        let size = response.body.len() as u64;

        if let Some(declared) = response.content_length {
            if declared != size {
                return Err(SyncError::SizeMismatch {
                    key: item.key.clone(),
                    expected: declared,
                    actual: size,
                });
            }
        }
        if let Some(expected) = item.remote_size {
            if expected != size {
                return Err(SyncError::SizeMismatch {
                    key: item.key.clone(),
                    expected,
                    actual: size,
                });
            }
        }

        let digest = Digest::of_bytes(&response.body);
        if let Some(expected) = &item.remote_digest {
            if *expected != digest {
                return Err(SyncError::digest_mismatch(&item.key, expected, &digest));
            }
        }

        tokio::fs::create_dir_all(&self.settings.cache_dir).await?;
        let path = self
            .settings
            .cache_dir
            .join(format!("{}-{}", item.cache_stem(), Uuid::new_v4().simple()));
        tokio::fs::write(&path, &response.body).await?;

        debug!(key = %item.key, digest = %digest, size, "Cached index file");
        Ok(Cached {
            path,
            digest,
            size,
            content_type: response.content_type,
            body: response.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join() {
        assert_eq!(join("ubuntu", "dists/jammy/Release"), "ubuntu/dists/jammy/Release");
        assert_eq!(join("http://o/ubuntu/", "/pool/a.deb"), "http://o/ubuntu/pool/a.deb");
        assert_eq!(join("", "pool/a.deb"), "pool/a.deb");
    }
}
