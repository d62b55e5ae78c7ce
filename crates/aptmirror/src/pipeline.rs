//! End-to-end mirror run
//!
//! Artifacts flow through the content sync pool while distributions are
//! parsed. Metadata batches are published only after the pool has drained,
//! so no manifest flips live before the artifacts it references exist.

use crate::config::MirrorConfig;
use crate::content::{ContentSettings, ContentStats, ContentSyncPool};
use crate::error::{SyncError, SyncResult};
use crate::index::{DistIndex, IndexParser, IndexSettings, IndexStats, PathFilter};
use crate::model::Batch;
use crate::origin::Origin;
use crate::publish::{BatchReport, MetadataPublisher, PublishSettings};
use crate::queue::WorkQueue;
use crate::retry::{Backoff, RetryPolicy};
use crate::signal::ErrorSignal;
use crate::storage::StoreConnector;
use chrono::NaiveDate;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Summary of one run
#[derive(Debug, Default, Clone, Serialize)]
pub struct SyncReport {
    pub content: ContentStats,
    pub index: IndexStats,
    pub batches: Vec<BatchReport>,
    /// Reason the error signal was raised, if it was
    pub error: Option<String>,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn exit_code(&self) -> u8 {
        if self.success() {
            0
        } else {
            1
        }
    }

    pub fn batch(&self, release: &str) -> Option<&BatchReport> {
        self.batches.iter().find(|b| b.release == release)
    }
}

pub struct MirrorPipeline {
    config: MirrorConfig,
    connector: Arc<dyn StoreConnector>,
    origin: Arc<dyn Origin>,
    signal: ErrorSignal,
    today: NaiveDate,
}

impl MirrorPipeline {
    pub fn new(config: MirrorConfig, connector: Arc<dyn StoreConnector>, origin: Arc<dyn Origin>) -> Self {
        Self {
            config,
            connector,
            origin,
            signal: ErrorSignal::new(),
            today: chrono::Utc::now().date_naive(),
        }
    }

    /// Date stamped on backups taken during this run
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// The run's error signal. Raising it stops the run at the next poll point.
    pub fn signal(&self) -> &ErrorSignal {
        &self.signal
    }

    pub async fn run(&self) -> SyncResult<SyncReport> {
        let run_dir = self
            .config
            .cache_dir
            .join(format!("run-{}", Uuid::new_v4().simple()));

        let result = self.run_in(&run_dir).await;

        if let Err(e) = tokio::fs::remove_dir_all(&run_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %run_dir.display(), error = %e, "Could not remove run cache directory");
            }
        }

        let mut report = result?;
        report.error = self.signal.reason().map(str::to_string);

        if report.success() {
            info!(
                uploaded = report.content.uploaded,
                skipped = report.content.skipped,
                repaired = report.content.repaired,
                batches = report.batches.len(),
                "Mirror run finished"
            );
        } else {
            error!(
                reason = report.error.as_deref().unwrap_or_default(),
                "Mirror run failed"
            );
        }
        Ok(report)
    }

    async fn run_in(&self, run_dir: &Path) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        let filter = PathFilter::new(&self.config.mirror.architectures)?;
        let store = self.connector.connect().await?;
        let publisher = MetadataPublisher::new(store, self.signal.clone(), self.publish_settings())?;

        let artifacts = Arc::new(WorkQueue::new("artifacts"));
        let pool = ContentSyncPool::start(
            self.content_settings(run_dir.join("spool")),
            self.connector.clone(),
            self.origin.clone(),
            artifacts.clone(),
            self.signal.clone(),
        );

        let parser = IndexParser::new(
            self.origin.clone(),
            artifacts.clone(),
            self.signal.clone(),
            self.index_settings(run_dir.to_path_buf()),
            filter,
        );
        let batches = self.parse_all(&parser, &mut report).await;

        artifacts.close();
        report.content = pool.finish().await;

        if self.signal.is_raised() {
            warn!(batches = batches.len(), "Error signal raised, no metadata will be published");
            return Ok(report);
        }

        for batch in batches {
            let batch_report = publisher.publish(batch).await;
            let succeeded = batch_report.succeeded();
            report.batches.push(batch_report);
            if !succeeded {
                break;
            }
        }

        Ok(report)
    }

    async fn parse_all(&self, parser: &IndexParser, report: &mut SyncReport) -> Vec<Batch> {
        let mut batches = Vec::new();

        for dist in &self.config.mirror.dists {
            if self.signal.is_raised() {
                break;
            }
            match parser.parse_dist(dist).await {
                Ok(DistIndex { batch, stats }) => {
                    report.index.merge(stats);
                    batches.push(batch);
                },
                Err(SyncError::Cancelled(_)) => break,
                Err(e) => {
                    error!(dist = %dist, error = %e, "Distribution parse failed");
                    break;
                },
            }
        }

        batches
    }

    fn content_settings(&self, spool_dir: PathBuf) -> ContentSettings {
        ContentSettings {
            workers: self.config.workers.content_workers,
            retry: RetryPolicy::new(self.config.retry.max_retry, Backoff::None),
            recycle_after: self.config.workers.recycle_after,
            spool_dir,
        }
    }

    fn index_settings(&self, cache_dir: PathBuf) -> IndexSettings {
        IndexSettings {
            origin_base: self.config.origin.base_url(),
            dest_prefix: self.config.mirror.dest_prefix.clone(),
            cache_dir,
            workers: self.config.workers.index_workers,
            retry: RetryPolicy::new(self.config.retry.index_retry, Backoff::None),
        }
    }

    fn publish_settings(&self) -> PublishSettings {
        PublishSettings {
            retry: RetryPolicy::new(self.config.retry.max_retry, Backoff::None),
            flip: RetryPolicy::new(
                self.config.retry.flip_retry,
                Backoff::Linear(self.config.retry.flip_backoff()),
            ),
            backup_days: self.config.mirror.backup_days,
            today: self.today,
        }
    }
}
