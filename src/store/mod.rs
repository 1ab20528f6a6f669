pub mod redis;
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// A single HTTP header pair. Multi-valued fields are repeated pairs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The value type persisted by every repository backend.
///
/// The serialized field names are the compatibility contract shared with
/// other implementations: `status_code`, `headers`, `body_base64`. Headers
/// are stored sorted ascending by `(key, value)`; the body is standard
/// padded base64 with the empty string denoting an empty body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status_code: u16,
    #[serde(default, deserialize_with = "nullable_headers")]
    pub headers: Vec<Header>,
    #[serde(default)]
    pub body_base64: String,
}

// Entries written by other implementations encode header-less responses as
// `"headers": null` rather than an empty array.
fn nullable_headers<'de, D>(deserializer: D) -> Result<Vec<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    let headers: Option<Vec<Header>> = Option::deserialize(deserializer)?;
    Ok(headers.unwrap_or_default())
}

impl StoredResponse {
    /// Returns the first header value matching `key`, case-insensitively.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.key.eq_ignore_ascii_case(key))
            .map(|header| header.value.as_str())
    }

    /// Replaces the value of the first header matching `key`, or appends a
    /// new pair when none exists.
    pub fn set_header(&mut self, key: &str, value: String) {
        for header in &mut self.headers {
            if header.key.eq_ignore_ascii_case(key) {
                header.value = value;
                return;
            }
        }
        self.headers.push(Header::new(key, value));
    }

    /// Drops every header matching `key`, case-insensitively.
    pub fn remove_header(&mut self, key: &str) {
        self.headers
            .retain(|header| !header.key.eq_ignore_ascii_case(key));
    }
}

/// Errors surfaced by repository backends. Logical misses are not errors;
/// they are `Ok(None)` from `get`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Config(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("redis protocol: {0}")]
    Protocol(String),

    #[error("unexpected redis reply: {0}")]
    UnexpectedReply(String),

    #[error("operation timed out")]
    Timeout,

    #[error("encode stored response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("decode stored response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Abstract key → StoredResponse store shared by both backends.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Fetches the entry at `key`. `Ok(None)` signals a miss.
    async fn get(&self, key: &str) -> Result<Option<StoredResponse>, StoreError>;

    /// Persists `value` at `key`. With `overwrite` an existing entry is
    /// replaced; without it an existing entry is preserved and the call
    /// succeeds silently.
    async fn set(&self, key: &str, value: &StoredResponse, overwrite: bool)
        -> Result<(), StoreError>;

    /// Releases backend resources.
    async fn close(&self) -> Result<(), StoreError>;
}

pub(crate) fn encode_stored_response(response: &StoredResponse) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(response).map_err(StoreError::Encode)
}

pub(crate) fn decode_stored_response(payload: &[u8]) -> Result<StoredResponse, StoreError> {
    serde_json::from_slice(payload).map_err(StoreError::Decode)
}
