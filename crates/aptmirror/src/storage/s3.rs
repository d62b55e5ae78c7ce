use super::{Metadata, ObjectInfo, ObjectStore, PutBody, PutObject, StorageConfig, StoreConnector};
use crate::error::{SyncError, SyncResult};
use aptmirror_common::Digest;
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{AccessControlPolicy, MetadataDirective},
    Client,
};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Characters left unescaped in an `x-amz-copy-source` path
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: &StorageConfig) -> SyncResult<Self> {
        debug!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            region = %config.region,
            "Initializing S3 store"
        );

        let mut builder = match config.static_credentials() {
            Some((access_key, secret_key)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(access_key, secret_key, None, None, "aptmirror")),
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.bucket, utf8_percent_encode(key, COPY_SOURCE))
    }

    async fn copy_acl(&self, src_key: &str, dst_key: &str) -> SyncResult<()> {
        let acl = self
            .client
            .get_object_acl()
            .bucket(&self.bucket)
            .key(src_key)
            .send()
            .await
            .map_err(|e| SyncError::store(src_key, DisplayErrorContext(&e)))?;

        let policy = AccessControlPolicy::builder()
            .set_grants(Some(acl.grants().to_vec()))
            .set_owner(acl.owner().cloned())
            .build();

        self.client
            .put_object_acl()
            .bucket(&self.bucket)
            .key(dst_key)
            .access_control_policy(policy)
            .send()
            .await
            .map_err(|e| SyncError::store(dst_key, DisplayErrorContext(&e)))?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> SyncResult<Option<ObjectInfo>> {
        let response = match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) => {
                return Ok(None);
            },
            Err(e) => return Err(SyncError::store(key, DisplayErrorContext(&e))),
        };

        Ok(Some(ObjectInfo {
            key: key.to_string(),
            digest: response.e_tag().and_then(|etag| Digest::from_etag(etag).ok()),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            content_type: response.content_type().map(str::to_string),
            metadata: response.metadata().cloned().unwrap_or_default(),
        }))
    }

    #[instrument(skip(self, object))]
    async fn put(&self, key: &str, object: PutObject) -> SyncResult<Digest> {
        let body = match &object.body {
            PutBody::Bytes(bytes) => ByteStream::from(bytes.clone()),
            PutBody::File(path) => ByteStream::from_path(path)
                .await
                .map_err(|e| SyncError::store(key, format!("cannot stream {}: {}", path.display(), e)))?,
        };

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .set_content_type(object.content_type)
            .set_content_md5(object.content_md5.as_ref().map(|d| d.encoded().to_string()));

        if !object.metadata.is_empty() {
            request = request.set_metadata(Some(object.metadata));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SyncError::store(key, DisplayErrorContext(&e)))?;

        match response.e_tag().map(Digest::from_etag) {
            Some(Ok(digest)) => {
                info!(key = %key, digest = %digest, "Uploaded to s3://{}/{}", self.bucket, key);
                Ok(digest)
            },
            _ => self
                .get(key)
                .await?
                .and_then(|info| info.digest)
                .ok_or_else(|| SyncError::store(key, "store returned no usable entity tag")),
        }
    }

    #[instrument(skip(self, metadata))]
    async fn copy(
        &self,
        src_key: &str,
        dst_key: &str,
        metadata: Option<&Metadata>,
        preserve_acl: bool,
    ) -> SyncResult<()> {
        let mut request = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(self.copy_source(src_key))
            .key(dst_key);

        if let Some(metadata) = metadata {
            // REPLACE drops the source's content type unless it is restated
            let source = self
                .get(src_key)
                .await?
                .ok_or_else(|| SyncError::store(src_key, "copy source does not exist"))?;

            request = request
                .metadata_directive(MetadataDirective::Replace)
                .set_metadata(Some(metadata.clone()))
                .set_content_type(source.content_type);
        }

        request
            .send()
            .await
            .map_err(|e| SyncError::store(dst_key, DisplayErrorContext(&e)))?;

        if preserve_acl {
            self.copy_acl(src_key, dst_key).await?;
        }

        debug!(src = %src_key, dst = %dst_key, "Copied object");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> SyncResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| SyncError::store(key, DisplayErrorContext(&e)))?;

        info!(key = %key, "Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> SyncResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| SyncError::store(prefix, DisplayErrorContext(&e)))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
        }

        debug!(prefix = %prefix, count = keys.len(), "Listed objects");
        Ok(keys)
    }
}

/// Builds a new S3 client per connection
pub struct S3Connector {
    config: StorageConfig,
}

impl S3Connector {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for S3Connector {
    async fn connect(&self) -> SyncResult<Arc<dyn ObjectStore>> {
        Ok(Arc::new(S3Store::new(&self.config).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_source_escapes_reserved_characters() {
        let store = S3Store::new(&StorageConfig::for_minio("http://localhost:9000", "mirror"))
            .await
            .unwrap();

        assert_eq!(
            store.copy_source("pool/main/g/g++/g++_1.0_amd64.deb"),
            "mirror/pool/main/g/g%2B%2B/g%2B%2B_1.0_amd64.deb"
        );
        assert_eq!(store.copy_source("a b/c~d.deb"), "mirror/a%20b/c~d.deb");
    }
}
