//! reqwest origin against a mock HTTP server

use aptmirror::origin::{fetch, Fetched, HttpOrigin, Origin};
use aptmirror::retry::{Backoff, RetryPolicy};
use aptmirror::{ErrorSignal, SyncError};
use futures::TryStreamExt;
use std::time::Duration;
use wiremock::{
    matchers::{header_exists, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn origin() -> HttpOrigin {
    HttpOrigin::new(Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_get_returns_body_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ubuntu/dists/jammy/Release"))
        .and(header_exists("user-agent"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(b"Origin: Ubuntu\n".to_vec())
                .insert_header("content-type", "text/plain"),
        )
        .mount(&server)
        .await;

    let response = origin()
        .get(&format!("{}/ubuntu/dists/jammy/Release", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_ref(), b"Origin: Ubuntu\n");
    assert_eq!(response.content_type.as_deref(), Some("text/plain"));
    assert_eq!(response.content_length, Some(15));
}

#[tokio::test]
async fn test_not_found_is_absent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let url = format!("{}/ubuntu/pool/missing.deb", server.uri());
    let fetched = fetch(
        &origin(),
        &url,
        &RetryPolicy::new(3, Backoff::None),
        &ErrorSignal::new(),
    )
    .await
    .unwrap();

    assert!(matches!(fetched, Fetched::Absent));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_server_errors_are_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let url = format!("{}/ubuntu/pool/a.deb", server.uri());
    let fetched = fetch(
        &origin(),
        &url,
        &RetryPolicy::new(5, Backoff::None),
        &ErrorSignal::new(),
    )
    .await
    .unwrap();

    match fetched {
        Fetched::Found(response) => assert_eq!(response.body.as_ref(), b"ok"),
        Fetched::Absent => panic!("expected content"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_persistent_server_errors_exhaust_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let url = format!("{}/ubuntu/pool/a.deb", server.uri());
    let result = fetch(
        &origin(),
        &url,
        &RetryPolicy::new(2, Backoff::None),
        &ErrorSignal::new(),
    )
    .await;

    assert!(matches!(result, Err(SyncError::RetriesExhausted { attempts: 2, .. })));
}

#[tokio::test]
async fn test_raised_signal_stops_before_first_request() {
    let server = MockServer::start().await;
    let signal = ErrorSignal::new();
    signal.raise("test");

    let url = format!("{}/ubuntu/pool/a.deb", server.uri());
    let result = fetch(&origin(), &url, &RetryPolicy::new(3, Backoff::None), &signal).await;

    assert!(matches!(result, Err(SyncError::Cancelled(_))));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stream_yields_whole_body() {
    let server = MockServer::start().await;
    let body = vec![7u8; 64 * 1024];
    Mock::given(method("GET"))
        .and(path("/ubuntu/pool/main/b/big.deb"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let response = origin()
        .stream(&format!("{}/ubuntu/pool/main/b/big.deb", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.content_length, Some(body.len() as u64));
    let chunks: Vec<_> = response.body.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), body);
}

#[tokio::test]
async fn test_stream_of_missing_file_has_no_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
        .mount(&server)
        .await;

    let response = origin()
        .stream(&format!("{}/ubuntu/pool/missing.deb", server.uri()))
        .await
        .unwrap();

    assert_eq!(response.status, 404);
    let chunks: Vec<_> = response.body.try_collect().await.unwrap();
    assert!(chunks.is_empty());
}
