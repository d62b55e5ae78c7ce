//! Origin repository seam
//!
//! `200` is content, `400`/`404` mean the path is absent upstream and is
//! excluded from the run, anything else is worth retrying.

use crate::error::{SyncError, SyncResult};
use crate::retry::{Attempt, RetryPolicy};
use crate::signal::ErrorSignal;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tracing::warn;

pub mod http;
pub mod memory;

pub use http::HttpOrigin;
pub use memory::MemoryOrigin;

#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: Bytes,
}

impl OriginResponse {
    pub fn ok(body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status: 200,
            content_type: None,
            content_length: Some(body.len() as u64),
            body,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            content_length: None,
            body: Bytes::new(),
        }
    }
}

/// Response whose body is handed over as it arrives
pub struct OriginStream {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, SyncResult<Bytes>>,
}

impl From<OriginResponse> for OriginStream {
    fn from(response: OriginResponse) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type,
            content_length: response.content_length,
            body: stream::once(async move { Ok(response.body) }).boxed(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Fetched {
    Found(OriginResponse),
    /// 400/404 upstream
    Absent,
}

#[async_trait]
pub trait Origin: Send + Sync {
    /// One GET. Transport failures are `Err`; any HTTP status is `Ok`.
    async fn get(&self, url: &str) -> SyncResult<OriginResponse>;

    /// One GET with the body left on the wire. Artifacts go through here so
    /// a worker never holds a whole package in memory.
    async fn stream(&self, url: &str) -> SyncResult<OriginStream> {
        Ok(self.get(url).await?.into())
    }
}

/// `Done(true)` for content, `Done(false)` when absent upstream
pub fn check_status(url: &str, status: u16) -> Attempt<bool> {
    match status {
        200 => Attempt::Done(true),
        400 | 404 => {
            warn!(url = %url, status, "Absent upstream, excluding from set");
            Attempt::Done(false)
        },
        status => Attempt::Retry(SyncError::network(url, format!("HTTP status {}", status))),
    }
}

/// Map one response onto an attempt outcome
pub fn classify(url: &str, response: OriginResponse) -> Attempt<Fetched> {
    match check_status(url, response.status) {
        Attempt::Done(true) => Attempt::Done(Fetched::Found(response)),
        Attempt::Done(false) => Attempt::Done(Fetched::Absent),
        Attempt::Retry(e) => Attempt::Retry(e),
        Attempt::Fatal(e) => Attempt::Fatal(e),
    }
}

/// GET `url` under `policy`, retrying transport errors and unexpected statuses
pub async fn fetch(
    origin: &dyn Origin,
    url: &str,
    policy: &RetryPolicy,
    signal: &ErrorSignal,
) -> SyncResult<Fetched> {
    policy
        .run(&format!("fetch {}", url), signal, |_| async move {
            match origin.get(url).await {
                Ok(response) => classify(url, response),
                Err(e) => Attempt::from_result(Err(e)),
            }
        })
        .await
}
