//! Upstream fetcher against a local origin: header scrubbing on the wire,
//! body forwarding, and response capture.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Uri};

use common::spawn_origin;
use replayd::upstream::{stored_response_from_http, UpstreamClient};

#[tokio::test]
async fn forwards_method_path_and_raw_query() {
    let seen = Arc::new(Mutex::new(None));
    let seen_handler = Arc::clone(&seen);
    let origin = spawn_origin(Arc::new(move |parts, _body| {
        *seen_handler.lock().unwrap() = Some(parts.uri.clone());
        (200, vec![], b"ok".to_vec())
    }))
    .await;

    let client = UpstreamClient::new(&origin.url, Duration::from_secs(5)).unwrap();
    let uri: Uri = "/get?b=2&a=1".parse().unwrap();
    let (status, _headers, body) = client
        .fetch(&Method::GET, &uri, &HeaderMap::new(), &Bytes::new())
        .await
        .unwrap();

    assert_eq!(status, 200);
    assert_eq!(body.as_ref(), b"ok");
    let forwarded = seen.lock().unwrap().clone().unwrap();
    assert_eq!(forwarded.path(), "/get");
    // The raw query goes upstream untouched; only the cache key sorts it.
    assert_eq!(forwarded.query(), Some("b=2&a=1"));
}

#[tokio::test]
async fn scrubbed_headers_never_reach_the_wire() {
    let seen = Arc::new(Mutex::new(None));
    let seen_handler = Arc::clone(&seen);
    let origin = spawn_origin(Arc::new(move |parts, _body| {
        *seen_handler.lock().unwrap() = Some(parts.headers.clone());
        (204, vec![], Vec::new())
    }))
    .await;

    let client = UpstreamClient::new(&origin.url, Duration::from_secs(5)).unwrap();
    let mut headers = HeaderMap::new();
    headers.insert("connection", HeaderValue::from_static("x-session"));
    headers.insert("x-session", HeaderValue::from_static("abc"));
    headers.insert("proxy-authorization", HeaderValue::from_static("Basic xyz"));
    headers.insert("accept-encoding", HeaderValue::from_static("gzip, br"));
    headers.insert("x-request-id", HeaderValue::from_static("keep-me"));

    let uri: Uri = "/headers".parse().unwrap();
    client
        .fetch(&Method::GET, &uri, &headers, &Bytes::new())
        .await
        .unwrap();

    let forwarded = seen.lock().unwrap().clone().unwrap();
    assert!(forwarded.get("connection").is_none());
    assert!(forwarded.get("x-session").is_none());
    assert!(forwarded.get("proxy-authorization").is_none());
    assert_eq!(forwarded.get("accept-encoding").unwrap(), "identity");
    assert_eq!(forwarded.get("x-request-id").unwrap(), "keep-me");
}

#[tokio::test]
async fn forwards_the_buffered_body_verbatim() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_handler = Arc::clone(&seen);
    let origin = spawn_origin(Arc::new(move |_parts, body| {
        *seen_handler.lock().unwrap() = body.to_vec();
        (201, vec![], Vec::new())
    }))
    .await;

    let client = UpstreamClient::new(&origin.url, Duration::from_secs(5)).unwrap();
    let uri: Uri = "/post".parse().unwrap();
    let body = Bytes::from_static(b"\x00binary\xffpayload");
    let (status, _, _) = client
        .fetch(&Method::POST, &uri, &HeaderMap::new(), &body)
        .await
        .unwrap();

    assert_eq!(status, 201);
    assert_eq!(*seen.lock().unwrap(), body.to_vec());
}

#[tokio::test]
async fn captured_responses_normalize_to_stored_form() {
    let origin = spawn_origin(Arc::new(|_parts, _body| {
        (
            200,
            vec![
                ("x-b".to_string(), "2".to_string()),
                ("x-a".to_string(), "1".to_string()),
            ],
            b"payload".to_vec(),
        )
    }))
    .await;

    let client = UpstreamClient::new(&origin.url, Duration::from_secs(5)).unwrap();
    let uri: Uri = "/c".parse().unwrap();
    let (status, headers, body) = client
        .fetch(&Method::GET, &uri, &HeaderMap::new(), &Bytes::new())
        .await
        .unwrap();

    let stored = stored_response_from_http(status, &headers, &body);
    assert_eq!(stored.status_code, 200);
    assert_eq!(STANDARD.decode(&stored.body_base64).unwrap(), b"payload");

    let xa = stored.headers.iter().position(|h| h.key == "x-a").unwrap();
    let xb = stored.headers.iter().position(|h| h.key == "x-b").unwrap();
    assert!(xa < xb, "headers are stored sorted by (key, value)");
}

#[tokio::test]
async fn transport_failures_propagate() {
    // Nothing listens on this port.
    let client = UpstreamClient::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
    let uri: Uri = "/x".parse().unwrap();
    assert!(client
        .fetch(&Method::GET, &uri, &HeaderMap::new(), &Bytes::new())
        .await
        .is_err());
}
