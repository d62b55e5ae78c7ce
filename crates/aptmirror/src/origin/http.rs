use super::{Origin, OriginResponse, OriginStream};
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::{header, Client, Response};
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// reqwest-backed origin client
#[derive(Clone)]
pub struct HttpOrigin {
    client: Client,
}

impl HttpOrigin {
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("aptmirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    async fn send(&self, url: &str) -> SyncResult<Response> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| SyncError::network(url, e))
    }
}

fn content_type(response: &Response) -> Option<String> {
    response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl Origin for HttpOrigin {
    #[instrument(skip(self))]
    async fn get(&self, url: &str) -> SyncResult<OriginResponse> {
        let response = self.send(url).await?;
        let status = response.status().as_u16();
        let content_type = content_type(&response);
        let content_length = response.content_length();

        if status != 200 {
            debug!(url = %url, status, "Non-success status from origin");
            return Ok(OriginResponse {
                status,
                content_type,
                content_length,
                body: bytes::Bytes::new(),
            });
        }

        let body = response.bytes().await.map_err(|e| SyncError::network(url, e))?;
        debug!(url = %url, bytes = body.len(), "Fetched from origin");

        Ok(OriginResponse {
            status,
            content_type,
            content_length,
            body,
        })
    }

    #[instrument(skip(self))]
    async fn stream(&self, url: &str) -> SyncResult<OriginStream> {
        let response = self.send(url).await?;
        let status = response.status().as_u16();
        let content_type = content_type(&response);
        let content_length = response.content_length();

        let body = if status == 200 {
            let owned = url.to_string();
            response
                .bytes_stream()
                .map_err(move |e| SyncError::network(owned.as_str(), e))
                .boxed()
        } else {
            debug!(url = %url, status, "Non-success status from origin");
            stream::empty().boxed()
        };

        Ok(OriginStream {
            status,
            content_type,
            content_length,
            body,
        })
    }
}
