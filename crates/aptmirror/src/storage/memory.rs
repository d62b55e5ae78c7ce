//! In-process object store
//!
//! Used by tests and dry runs. Failures can be injected per operation and
//! key, and every call is recorded so tests can assert on the exact sequence
//! of store operations.

use super::{Metadata, ObjectInfo, ObjectStore, PutBody, PutObject, StoreConnector};
use crate::error::{SyncError, SyncResult};
use aptmirror_common::Digest;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Put,
    Copy,
    Delete,
    List,
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: Option<String>,
    pub metadata: Metadata,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, StoredObject>,
    /// Remaining injected failures per (operation, key)
    failures: HashMap<(StoreOp, String), u32>,
    /// Keys whose reported digest is forced to a wrong value
    corrupt: HashMap<String, Digest>,
    /// Source keys whose copies land damaged
    damaged_sources: HashSet<String>,
    calls: Vec<(StoreOp, String)>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object directly, bypassing call recording
    pub fn insert(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.insert_with(key, data, Metadata::new());
    }

    pub fn insert_with(&self, key: impl Into<String>, data: impl Into<Bytes>, metadata: Metadata) {
        self.lock().objects.insert(
            key.into(),
            StoredObject {
                data: data.into(),
                content_type: None,
                metadata,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn data(&self, key: &str) -> Option<Bytes> {
        self.object(key).map(|o| o.data)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Make the next `times` calls of `op` on `key` fail
    pub fn fail(&self, op: StoreOp, key: impl Into<String>, times: u32) {
        self.lock().failures.insert((op, key.into()), times);
    }

    /// Report `digest` for `key` regardless of its content
    pub fn corrupt_digest(&self, key: impl Into<String>, digest: Digest) {
        self.lock().corrupt.insert(key.into(), digest);
    }

    /// Every later copy from `src_key` writes bytes that differ from the source
    pub fn damage_copies_from(&self, src_key: impl Into<String>) {
        self.lock().damaged_sources.insert(src_key.into());
    }

    pub fn calls(&self) -> Vec<(StoreOp, String)> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: StoreOp) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn count_for(&self, op: StoreOp, key: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|(o, k)| *o == op && k == key)
            .count()
    }

    /// Record a call and consume one injected failure if present
    fn enter(&self, op: StoreOp, key: &str) -> SyncResult<()> {
        let mut state = self.lock();
        state.calls.push((op, key.to_string()));

        if let Some(remaining) = state.failures.get_mut(&(op, key.to_string())) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::store(key, format!("injected {:?} failure", op)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> SyncResult<Option<ObjectInfo>> {
        self.enter(StoreOp::Get, key)?;
        let state = self.lock();

        Ok(state.objects.get(key).map(|object| ObjectInfo {
            key: key.to_string(),
            digest: Some(
                state
                    .corrupt
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| Digest::of_bytes(&object.data)),
            ),
            size: object.data.len() as u64,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
        }))
    }

    async fn put(&self, key: &str, object: PutObject) -> SyncResult<Digest> {
        self.enter(StoreOp::Put, key)?;

        let data = match object.body {
            PutBody::Bytes(bytes) => bytes,
            PutBody::File(path) => Bytes::from(tokio::fs::read(&path).await?),
        };
        let digest = Digest::of_bytes(&data);

        if let Some(expected) = &object.content_md5 {
            if *expected != digest {
                return Err(SyncError::store(key, "Content-MD5 does not match body"));
            }
        }

        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: object.content_type,
                metadata: object.metadata,
            },
        );
        Ok(digest)
    }

    async fn copy(
        &self,
        src_key: &str,
        dst_key: &str,
        metadata: Option<&Metadata>,
        _preserve_acl: bool,
    ) -> SyncResult<()> {
        self.enter(StoreOp::Copy, dst_key)?;
        let mut state = self.lock();

        let mut object = state
            .objects
            .get(src_key)
            .cloned()
            .ok_or_else(|| SyncError::store(src_key, "NoSuchKey"))?;

        if let Some(metadata) = metadata {
            object.metadata = metadata.clone();
        }
        if state.damaged_sources.contains(src_key) {
            let mut data = object.data.to_vec();
            data.push(b'~');
            object.data = Bytes::from(data);
        }

        state.objects.insert(dst_key.to_string(), object);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.enter(StoreOp::Delete, key)?;
        self.lock().objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> SyncResult<Vec<String>> {
        self.enter(StoreOp::List, prefix)?;
        Ok(self
            .lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Hands out the same shared store on every connect
#[async_trait]
impl StoreConnector for MemoryStore {
    async fn connect(&self) -> SyncResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_reports_md5() {
        let store = MemoryStore::new();
        let digest = store
            .put("a", PutObject::new(PutBody::Bytes(Bytes::from_static(b"hello"))))
            .await
            .unwrap();

        let info = store.get("a").await.unwrap().unwrap();
        assert_eq!(info.digest, Some(digest.clone()));
        assert_eq!(digest, Digest::of_bytes(b"hello"));
        assert_eq!(info.size, 5);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_bad_content_md5() {
        let store = MemoryStore::new();
        let object = PutObject::new(PutBody::Bytes(Bytes::from_static(b"hello")))
            .content_md5(Some(Digest::of_bytes(b"other")));

        assert!(store.put("a", object).await.is_err());
        assert!(!store.contains("a"));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.insert("a", "x");
        store.fail(StoreOp::Get, "a", 2);

        assert!(store.get("a").await.is_err());
        assert!(store.get("a").await.is_err());
        assert!(store.get("a").await.unwrap().is_some());
        assert_eq!(store.count_for(StoreOp::Get, "a"), 3);
    }

    #[tokio::test]
    async fn test_copy_replaces_or_keeps_metadata() {
        let store = MemoryStore::new();
        store.insert_with("src", "x", Metadata::from([("k".to_string(), "v".to_string())]));

        store.copy("src", "kept", None, false).await.unwrap();
        store
            .copy("src", "replaced", Some(&Metadata::from([("n".to_string(), "1".to_string())])), false)
            .await
            .unwrap();

        assert_eq!(store.object("kept").unwrap().metadata["k"], "v");
        let replaced = store.object("replaced").unwrap().metadata;
        assert!(!replaced.contains_key("k"));
        assert_eq!(replaced["n"], "1");
        assert!(store.copy("missing", "dst", None, false).await.is_err());
    }

    #[tokio::test]
    async fn test_damaged_copies_differ_from_source() {
        let store = MemoryStore::new();
        store.insert("src", "payload");
        store.damage_copies_from("src");

        store.copy("src", "dst", None, false).await.unwrap();

        let source = store.get("src").await.unwrap().unwrap();
        let copy = store.get("dst").await.unwrap().unwrap();
        assert_ne!(source.digest, copy.digest);
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = MemoryStore::new();
        store.insert("dists/jammy/Release", "1");
        store.insert("dists/jammy/Release-latest", "2");
        store.insert("pool/a.deb", "3");

        let keys = store.list("dists/").await.unwrap();
        assert_eq!(keys, vec!["dists/jammy/Release", "dists/jammy/Release-latest"]);
    }
}
