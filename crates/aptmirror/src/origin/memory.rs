use super::{Origin, OriginResponse, OriginStream};
use crate::error::SyncResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct State {
    responses: HashMap<String, OriginResponse>,
    /// Remaining `503` answers per URL before the real response
    failures: HashMap<String, u32>,
    requests: HashMap<String, usize>,
}

/// Streamed bodies arrive in pieces this small
const STREAM_CHUNK: usize = 5;

/// Canned origin. Unknown URLs answer `404`.
#[derive(Clone, Default)]
pub struct MemoryOrigin {
    state: Arc<Mutex<State>>,
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.respond(url, OriginResponse::ok(body));
    }

    pub fn respond(&self, url: impl Into<String>, response: OriginResponse) {
        self.lock().responses.insert(url.into(), response);
    }

    /// Answer `503` to the next `times` requests for `url`
    pub fn fail(&self, url: impl Into<String>, times: u32) {
        self.lock().failures.insert(url.into(), times);
    }

    pub fn requests(&self, url: &str) -> usize {
        self.lock().requests.get(url).copied().unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.lock().requests.values().sum()
    }
}

#[async_trait]
impl Origin for MemoryOrigin {
    async fn get(&self, url: &str) -> SyncResult<OriginResponse> {
        let mut state = self.lock();
        *state.requests.entry(url.to_string()).or_default() += 1;

        if let Some(remaining) = state.failures.get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(OriginResponse::status(503));
            }
        }

        Ok(state
            .responses
            .get(url)
            .cloned()
            .unwrap_or_else(|| OriginResponse::status(404)))
    }

    async fn stream(&self, url: &str) -> SyncResult<OriginStream> {
        let response = self.get(url).await?;
        let chunks: Vec<SyncResult<Bytes>> = response
            .body
            .chunks(STREAM_CHUNK)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();

        Ok(OriginStream {
            status: response.status,
            content_type: response.content_type,
            content_length: response.content_length,
            body: stream::iter(chunks).boxed(),
        })
    }
}
