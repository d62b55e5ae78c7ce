//! Object store seam
//!
//! The mirror only needs five operations from a store: read an object's
//! digest and metadata, write, store-side copy, delete, and list by prefix.
//! [`S3Store`] talks to S3 or MinIO; [`MemoryStore`] keeps everything in
//! process and can inject failures.
//!
//! Store handles are not assumed to be safe for unbounded reuse. Workers hold
//! a [`StoreHandle`], which mints a fresh connection from a [`StoreConnector`]
//! every `recycle_after` items.

use crate::error::SyncResult;
use aptmirror_common::Digest;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

pub mod config;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use memory::{MemoryStore, StoreOp};
pub use s3::{S3Connector, S3Store};

pub type Metadata = HashMap<String, String>;

/// What `get` reports about a stored object
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    /// `None` when the entity tag is not a content digest (multipart upload)
    pub digest: Option<Digest>,
    pub size: u64,
    pub content_type: Option<String>,
    pub metadata: Metadata,
}

impl ObjectInfo {
    pub fn matches(&self, expected: &Digest) -> bool {
        self.digest.as_ref() == Some(expected)
    }
}

#[derive(Debug, Clone)]
pub enum PutBody {
    Bytes(Bytes),
    /// Streamed from disk
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct PutObject {
    pub body: PutBody,
    pub content_type: Option<String>,
    pub metadata: Metadata,
    /// Sent as `Content-MD5` so the store rejects corrupted transfers itself
    pub content_md5: Option<Digest>,
}

impl PutObject {
    pub fn new(body: PutBody) -> Self {
        Self {
            body,
            content_type: None,
            metadata: Metadata::new(),
            content_md5: None,
        }
    }

    pub fn content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn content_md5(mut self, digest: Option<Digest>) -> Self {
        self.content_md5 = digest;
        self
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// `Ok(None)` when the key does not exist
    async fn get(&self, key: &str) -> SyncResult<Option<ObjectInfo>>;

    /// Write an object and return the digest the store reports for it
    async fn put(&self, key: &str, object: PutObject) -> SyncResult<Digest>;

    /// Store-side copy. `metadata: None` keeps the source's metadata,
    /// `Some` replaces it.
    async fn copy(
        &self,
        src_key: &str,
        dst_key: &str,
        metadata: Option<&Metadata>,
        preserve_acl: bool,
    ) -> SyncResult<()>;

    async fn delete(&self, key: &str) -> SyncResult<()>;

    async fn list(&self, prefix: &str) -> SyncResult<Vec<String>>;
}

/// Produces fresh store handles
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> SyncResult<Arc<dyn ObjectStore>>;
}

/// Default number of items a worker processes before reconnecting
pub const DEFAULT_RECYCLE_AFTER: u32 = 90;

/// A worker's own store connection, recycled periodically
pub struct StoreHandle {
    connector: Arc<dyn StoreConnector>,
    current: Option<Arc<dyn ObjectStore>>,
    uses: u32,
    recycle_after: u32,
}

impl StoreHandle {
    pub fn new(connector: Arc<dyn StoreConnector>, recycle_after: u32) -> Self {
        Self {
            connector,
            current: None,
            uses: 0,
            recycle_after: recycle_after.max(1),
        }
    }

    /// Handle for the next item, reconnecting once the use budget is spent
    pub async fn acquire(&mut self) -> SyncResult<Arc<dyn ObjectStore>> {
        if self.uses >= self.recycle_after {
            debug!(uses = self.uses, "Recycling store connection");
            self.current = None;
        }

        let store = match &self.current {
            Some(store) => store.clone(),
            None => {
                let store = self.connector.connect().await?;
                self.current = Some(store.clone());
                self.uses = 0;
                store
            },
        };

        self.uses += 1;
        Ok(store)
    }

    /// Drop the connection after an error so the next item starts clean
    pub fn reset(&mut self) {
        self.current = None;
    }
}
