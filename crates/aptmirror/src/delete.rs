//! Delete worker and purge of expired backups
//!
//! Deletion is best effort and independent of the publish protocol: every
//! failure is logged and counted, never escalated.

use crate::error::SyncResult;
use crate::model::{day_ordinal, META_DELETE_ORDINAL};
use crate::queue::WorkQueue;
use crate::storage::{Metadata, ObjectStore};
use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteStats {
    pub deleted: usize,
    /// Purge date not reached yet
    pub retained: usize,
    pub missing: usize,
    pub failed: usize,
}

impl DeleteStats {
    fn merge(&mut self, other: DeleteStats) {
        self.deleted += other.deleted;
        self.retained += other.retained;
        self.missing += other.missing;
        self.failed += other.failed;
    }
}

pub struct DeleteWorker {
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue<String>>,
    /// Day ordinal keys must be tagged for, at or before, to be deleted
    expired_by: Option<i64>,
}

impl DeleteWorker {
    pub fn new(store: Arc<dyn ObjectStore>, queue: Arc<WorkQueue<String>>) -> Self {
        Self {
            store,
            queue,
            expired_by: None,
        }
    }

    /// Only delete keys whose purge tag has passed on `today`
    pub fn expired_on(mut self, today: NaiveDate) -> Self {
        self.expired_by = Some(day_ordinal(today));
        self
    }

    /// Drain the queue until it is closed and empty
    pub async fn run(self) -> DeleteStats {
        let mut stats = DeleteStats::default();

        while let Some(key) = self.queue.pop().await {
            match self.store.get(&key).await {
                Ok(Some(info)) if !self.is_due(&info.metadata) => {
                    stats.retained += 1;
                },
                Ok(Some(_)) => match self.store.delete(&key).await {
                    Ok(()) => {
                        stats.deleted += 1;
                        info!(key = %key, "Deleted");
                    },
                    Err(e) => {
                        stats.failed += 1;
                        error!(key = %key, error = %e, "Failed to delete");
                    },
                },
                Ok(None) => {
                    stats.missing += 1;
                    debug!(key = %key, "Already gone");
                },
                Err(e) => {
                    stats.failed += 1;
                    error!(key = %key, error = %e, "Failed to inspect key before delete");
                },
            }
            self.queue.task_done();
        }

        stats
    }

    fn is_due(&self, metadata: &Metadata) -> bool {
        let Some(expired_by) = self.expired_by else {
            return true;
        };

        metadata
            .get(META_DELETE_ORDINAL)
            .and_then(|ordinal| ordinal.parse::<i64>().ok())
            .is_some_and(|ordinal| ordinal <= expired_by)
    }
}

/// Delete every key under `prefix` whose purge date has passed. Keys are
/// inspected and deleted by `workers` concurrent workers.
pub async fn purge_expired(
    store: Arc<dyn ObjectStore>,
    prefix: &str,
    today: NaiveDate,
    workers: usize,
) -> SyncResult<DeleteStats> {
    let keys = store.list(prefix).await?;
    let queue = Arc::new(WorkQueue::new("purge"));

    info!(prefix = %prefix, candidates = keys.len(), "Scanning for expired backups");

    for key in keys {
        // Only this function holds the queue open
        let _ = queue.push(key);
    }
    queue.close();

    let handles = (0..workers.max(1)).map(|_| {
        let worker = DeleteWorker::new(store.clone(), queue.clone()).expired_on(today);
        tokio::spawn(worker.run())
    });

    let mut stats = DeleteStats::default();
    for result in futures::future::join_all(handles).await {
        match result {
            Ok(worker_stats) => stats.merge(worker_stats),
            Err(e) => error!(error = %e, "Delete worker panicked"),
        }
    }

    info!(
        deleted = stats.deleted,
        retained = stats.retained,
        missing = stats.missing,
        failed = stats.failed,
        "Purge finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::purge_metadata;
    use crate::storage::{MemoryStore, StoreOp};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_worker_deletes_present_keys_and_counts_missing() {
        let store = MemoryStore::new();
        store.insert("a", "1");
        store.fail(StoreOp::Delete, "b", 1);
        store.insert("b", "2");

        let queue = Arc::new(WorkQueue::new("delete"));
        for key in ["a", "b", "c"] {
            queue.push(key.to_string()).unwrap();
        }
        queue.close();

        let stats = DeleteWorker::new(Arc::new(store.clone()), queue).run().await;

        assert_eq!(
            stats,
            DeleteStats {
                deleted: 1,
                retained: 0,
                missing: 1,
                failed: 1
            }
        );
        assert!(!store.contains("a"));
        assert!(store.contains("b"));
    }

    #[tokio::test]
    async fn test_purge_only_expired_backups() {
        let store = MemoryStore::new();
        let tagged = date(2026, 10, 10);
        store.insert_with("dists/jammy/Release-2026-10-10", "old", purge_metadata(tagged, 3));
        store.insert_with("dists/jammy/Release-2026-10-15", "new", purge_metadata(date(2026, 10, 15), 3));
        store.insert("dists/jammy/Release", "live");

        let stats = purge_expired(Arc::new(store.clone()), "dists/", date(2026, 10, 16), 2)
            .await
            .unwrap();

        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.retained, 2);
        assert!(!store.contains("dists/jammy/Release-2026-10-10"));
        assert!(store.contains("dists/jammy/Release-2026-10-15"));
        assert!(store.contains("dists/jammy/Release"));
    }

    #[tokio::test]
    async fn test_purge_inspects_keys_on_every_worker() {
        let store = MemoryStore::new();
        let tagged = purge_metadata(date(2026, 10, 1), 3);
        for day in 1..=8 {
            store.insert_with(format!("dists/jammy/Release-2026-10-0{}", day), "old", tagged.clone());
        }
        store.fail(StoreOp::Get, "dists/jammy/Release-2026-10-08", 1);

        let stats = purge_expired(Arc::new(store.clone()), "dists/", date(2026, 10, 16), 4)
            .await
            .unwrap();

        assert_eq!(stats.deleted, 7);
        assert_eq!(stats.failed, 1);
        assert_eq!(store.count(StoreOp::Get), 8);
        assert_eq!(store.keys(), vec!["dists/jammy/Release-2026-10-08".to_string()]);
    }
}
