use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fingerprint::build_key;
use crate::plugin::{apply_request_plugins, apply_response_plugins, Plugin, RequestContext};
use crate::store::{Repository, StoredResponse};
use crate::upstream::{stored_response_from_http, UpstreamClient};

/// Per-server behavior knobs plus the ordered plugin pipeline.
pub struct ServerOptions {
    pub key_prefix: String,
    pub log_not_found: bool,
    pub record_overwrite: bool,
    /// Upstream statuses that are never written back. Replays are
    /// unaffected.
    pub record_ignore_statuses: Vec<u16>,
    pub plugins: Vec<Box<dyn Plugin>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            log_not_found: false,
            record_overwrite: false,
            record_ignore_statuses: vec![429],
            plugins: Vec::new(),
        }
    }
}

/// Everything a request handler needs, shared across connections.
pub struct ServerState {
    pub repository: Option<Arc<dyn Repository>>,
    pub upstream: Option<UpstreamClient>,
    pub options: ServerOptions,
}

/// Helper function to create standard HTTP BoxBody responses for errors (like 502/404)
fn empty_response(status: StatusCode) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(
            http_body_util::Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}

/// Accepts connections until the shutdown token fires, serving each on its
/// own task. Every request gets an independent `RequestContext`; nothing
/// request-local is shared.
pub async fn serve(listener: TcpListener, state: Arc<ServerState>, shutdown: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("Replay server listening on {}", addr),
        Err(_) => info!("Replay server listening"),
    }

    loop {
        // Accept new connections, or break on shutdown signal
        let (stream, peer) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Replay server shutting down gracefully; no new connections accepted.");
                break;
            }
        };
        debug!("Accepted connection from {}", peer);

        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req| {
                let state = Arc::clone(&state_clone);
                async move { handle_request(req, state).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                debug!("Error serving connection: {:?}", e);
            }
        });
    }
}

/// The per-request pipeline: buffer and fingerprint, run request-phase
/// plugins, answer from a short-circuit or the repository, otherwise fetch
/// upstream, record, and emit through the response-phase plugins.
pub async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let (parts, body) = req.into_parts();

    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("read request body: {}", e);
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
    };

    let key = match build_key(&parts.method, &parts.uri, &parts.headers, &body) {
        Ok(key) => key,
        Err(e) => {
            warn!("fingerprint request: {}", e);
            return Ok(empty_response(StatusCode::BAD_REQUEST));
        }
    };
    debug!(method = %parts.method, %key, "handling request");

    let mut ctx = RequestContext::new(
        parts.method,
        parts.uri,
        parts.headers,
        body,
        key,
        state.options.key_prefix.clone(),
        parts.version,
        state.repository.clone(),
    );

    if let Err(e) = apply_request_plugins(&state.options.plugins, &mut ctx).await {
        warn!("request plugin failed: {}", e);
        return Ok(empty_response(e.status()));
    }

    // A pre-populated response short-circuits both lookup and upstream.
    if let Some(mut stored) = ctx.response.take() {
        if let Err(e) = apply_response_plugins(&state.options.plugins, &mut ctx, &mut stored).await
        {
            warn!("response plugin failed: {}", e);
            return Ok(empty_response(e.status()));
        }
        return Ok(write_stored_response(&stored));
    }

    if !ctx.skip_cache {
        if let Some(repository) = ctx.repository.clone() {
            let lookup_key = ctx.prefixed_key();
            match repository.get(&lookup_key).await {
                Ok(Some(mut stored)) => {
                    ctx.cache_hit = true;
                    if let Err(e) =
                        apply_response_plugins(&state.options.plugins, &mut ctx, &mut stored).await
                    {
                        warn!("response plugin failed: {}", e);
                        return Ok(empty_response(e.status()));
                    }
                    return Ok(write_stored_response(&stored));
                }
                Ok(None) => {
                    if state.options.log_not_found {
                        info!(key = %lookup_key, "cache miss");
                    }
                }
                Err(e) => {
                    error!(key = %lookup_key, "cache lookup failed: {}", e);
                    return Ok(empty_response(StatusCode::BAD_GATEWAY));
                }
            }
        }
    }

    let Some(upstream) = state.upstream.as_ref() else {
        return Ok(empty_response(StatusCode::NOT_FOUND));
    };

    let (status, headers, response_body) =
        match upstream.fetch(&ctx.method, &ctx.uri, &ctx.headers, &ctx.body).await {
            Ok(fetched) => fetched,
            Err(e) => {
                error!("upstream fetch failed: {}", e);
                return Ok(empty_response(StatusCode::BAD_GATEWAY));
            }
        };

    let mut stored = stored_response_from_http(status, &headers, &response_body);

    // A failed write degrades to a log line; the client still gets the
    // upstream response.
    if !ctx.skip_store
        && !state
            .options
            .record_ignore_statuses
            .contains(&stored.status_code)
    {
        if let Some(repository) = ctx.repository.clone() {
            let store_key = ctx.prefixed_key();
            match repository
                .set(&store_key, &stored, state.options.record_overwrite)
                .await
            {
                Ok(()) => debug!(key = %store_key, "stored response"),
                Err(e) => warn!(key = %store_key, "store failed: {}", e),
            }
        }
    }

    if let Err(e) = apply_response_plugins(&state.options.plugins, &mut ctx, &mut stored).await {
        warn!("response plugin failed: {}", e);
        return Ok(empty_response(e.status()));
    }
    Ok(write_stored_response(&stored))
}

/// Builds the client-facing response from a stored one. Framing headers
/// are dropped so the HTTP server recomputes them, and a leftover
/// `Content-Encoding: gzip` is dropped with them since the emitted body is
/// not gzip-framed.
pub fn write_stored_response(stored: &StoredResponse) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = if stored.body_base64.is_empty() {
        Bytes::new()
    } else {
        match STANDARD.decode(&stored.body_base64) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!("decode stored body: {}", e);
                return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    };

    let status =
        StatusCode::from_u16(stored.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for header in &stored.headers {
        if should_skip_header(&header.key, &header.value) {
            continue;
        }
        builder = builder.header(&header.key, &header.value);
    }

    match builder.body(Full::new(body).map_err(|never| match never {}).boxed()) {
        Ok(response) => response,
        Err(e) => {
            error!("assemble stored response: {}", e);
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

fn should_skip_header(key: &str, value: &str) -> bool {
    if key.eq_ignore_ascii_case("Content-Length") {
        return true;
    }
    if key.eq_ignore_ascii_case("Transfer-Encoding") {
        return true;
    }
    key.eq_ignore_ascii_case("Content-Encoding") && value.eq_ignore_ascii_case("gzip")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Header;

    #[test]
    fn framing_headers_are_skipped() {
        assert!(should_skip_header("Content-Length", "12"));
        assert!(should_skip_header("transfer-encoding", "chunked"));
        assert!(should_skip_header("Content-Encoding", "gzip"));
        assert!(!should_skip_header("Content-Encoding", "br"));
        assert!(!should_skip_header("Content-Type", "text/plain"));
    }

    #[test]
    fn stored_response_becomes_http() {
        let stored = StoredResponse {
            status_code: 201,
            headers: vec![
                Header::new("Content-Length", "2"),
                Header::new("X-Fixture", "yes"),
            ],
            body_base64: "b2s=".to_string(),
        };
        let response = write_stored_response(&stored);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.headers().get("x-fixture").unwrap(), "yes");
    }
}
