use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use thiserror::Error;
use url::Url;

use crate::store::{Header, StoredResponse};

/// Headers meaningful only on a single transport hop. Never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream URL is required")]
    MissingUrl,

    #[error("upstream URL must include scheme and host")]
    InvalidUrl,

    #[error("parse upstream URL: {0}")]
    Parse(#[from] url::ParseError),

    #[error("upstream fetch: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Forwards requests to a configured base origin and captures the full
/// response. The incoming method, path and raw query are preserved; only
/// the scheme and host are replaced.
pub struct UpstreamClient {
    base: Url,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, UpstreamError> {
        let trimmed = base_url.trim();
        if trimmed.is_empty() {
            return Err(UpstreamError::MissingUrl);
        }
        let base = Url::parse(trimmed)?;
        if !base.has_host() || (base.scheme() != "http" && base.scheme() != "https") {
            return Err(UpstreamError::InvalidUrl);
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base, client })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Sends the buffered request to the origin and returns the buffered
    /// response. Transport failures (including the per-request timeout)
    /// propagate; the handler reports them as a bad gateway.
    pub async fn fetch(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes), UpstreamError> {
        let mut target = self.base.clone();
        target.set_path(uri.path());
        target.set_query(uri.query());

        let response = self
            .client
            .request(method.clone(), target)
            .headers(clone_request_headers(headers))
            .body(body.clone())
            .send()
            .await?;

        let status = response.status();
        let response_headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok((status, response_headers, body))
    }
}

/// Clones request headers for forwarding: hop-by-hop fields (and anything
/// the incoming `Connection` header names) are dropped, `Host` and
/// `Content-Length` are left to the client to recompute, and
/// `Accept-Encoding: identity` keeps captured bodies unencoded.
pub fn clone_request_headers(source: &HeaderMap) -> HeaderMap {
    let mut cloned = source.clone();
    strip_hop_by_hop_headers(&mut cloned);
    cloned.remove(HOST);
    cloned.remove(CONTENT_LENGTH);
    cloned.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    cloned
}

fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    // The Connection header names additional per-hop fields; collect them
    // before the standard list removes Connection itself.
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|field| field.trim().to_ascii_lowercase())
        .filter(|field| !field.is_empty())
        .collect();
    for field in &named {
        headers.remove(field.as_str());
    }
    for field in HOP_BY_HOP_HEADERS {
        headers.remove(field);
    }
}

/// Normalizes a captured response into the persisted form: headers sorted
/// ascending by `(key, value)`, body base64-encoded (empty string for an
/// empty body).
pub fn stored_response_from_http(
    status: StatusCode,
    headers: &HeaderMap,
    body: &[u8],
) -> StoredResponse {
    let mut pairs: Vec<Header> = headers
        .iter()
        .map(|(name, value)| {
            Header::new(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    pairs.sort();

    let body_base64 = if body.is_empty() {
        String::new()
    } else {
        STANDARD.encode(body)
    };

    StoredResponse {
        status_code: status.as_u16(),
        headers: pairs,
        body_base64,
    }
}
