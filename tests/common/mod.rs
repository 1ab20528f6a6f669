#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use replayd::server::{ServerState, serve};
use replayd::store::{Repository, StoreError, StoredResponse};

/// In-memory repository with call counters and injectable failures.
#[derive(Default)]
pub struct MemoryRepo {
    pub data: Mutex<HashMap<String, StoredResponse>>,
    pub get_calls: AtomicUsize,
    pub set_calls: AtomicUsize,
    pub fail_gets: AtomicBool,
    pub fail_sets: AtomicBool,
}

impl MemoryRepo {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn entry(&self, key: &str) -> Option<StoredResponse> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: &str, value: StoredResponse) {
        self.data.lock().unwrap().insert(key.to_string(), value);
    }

    pub fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

#[async_trait]
impl Repository for MemoryRepo {
    async fn get(&self, key: &str) -> Result<Option<StoredResponse>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(StoreError::Redis("injected get failure".to_string()));
        }
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    async fn set(
        &self,
        key: &str,
        value: &StoredResponse,
        overwrite: bool,
    ) -> Result<(), StoreError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_sets.load(Ordering::SeqCst) {
            return Err(StoreError::Redis("injected set failure".to_string()));
        }
        let mut data = self.data.lock().unwrap();
        if !overwrite && data.contains_key(key) {
            return Ok(());
        }
        data.insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Binds the replay server on an ephemeral port and serves it in the
/// background. Returns the base URL and the shutdown token.
pub async fn spawn_server(state: ServerState) -> (String, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    tokio::spawn(serve(listener, Arc::new(state), token.clone()));
    (format!("http://{addr}"), token)
}

pub type OriginResponse = (u16, Vec<(String, String)>, Vec<u8>);
pub type OriginHandler = Arc<dyn Fn(http::request::Parts, Bytes) -> OriginResponse + Send + Sync>;

/// A minimal scripted origin server for upstream-fetch tests. Counts the
/// requests it answers.
pub struct Origin {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
}

pub async fn spawn_origin(handler: OriginHandler) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let hits_accept = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let handler = Arc::clone(&handler);
            let hits = Arc::clone(&hits_accept);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let handler = Arc::clone(&handler);
                    let hits = Arc::clone(&hits);
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await?.to_bytes();
                        hits.fetch_add(1, Ordering::SeqCst);
                        let (status, headers, response_body) = handler(parts, body);
                        let mut builder = Response::builder().status(status);
                        for (key, value) in headers {
                            builder = builder.header(key, value);
                        }
                        Ok::<_, hyper::Error>(
                            builder.body(Full::new(Bytes::from(response_body))).unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, svc).await;
            });
        }
    });

    Origin {
        url: format!("http://{addr}"),
        hits,
    }
}
