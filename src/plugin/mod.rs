pub mod decoder;
pub mod dumper;
pub mod map_local;
pub mod map_remote;
pub mod record;
pub mod replay;
pub mod rules;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri};
use thiserror::Error;

use crate::store::{Repository, StoreError, StoredResponse};

/// Mutable per-request state threaded through the plugin pipeline.
///
/// Request-phase hooks may rewrite the request, set the bypass flags, or
/// pre-populate `response` to short-circuit both cache lookup and upstream
/// fetch. Response-phase hooks may mutate the stored response before it is
/// written to the client.
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Raw request body, fully buffered so plugins and the fingerprinter
    /// can read it more than once.
    pub body: Bytes,
    /// The request fingerprint. Plugins that rewrite the request are
    /// expected to recompute it.
    pub key: String,
    pub key_prefix: String,
    pub cache_hit: bool,
    pub skip_cache: bool,
    pub skip_store: bool,
    pub response: Option<StoredResponse>,
    pub version: http::Version,
    /// May be absent inside plugin unit tests.
    pub repository: Option<Arc<dyn Repository>>,
}

impl RequestContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        key: String,
        key_prefix: String,
        version: http::Version,
        repository: Option<Arc<dyn Repository>>,
    ) -> Self {
        Self {
            method,
            uri,
            headers,
            body,
            key,
            key_prefix,
            version,
            cache_hit: false,
            skip_cache: false,
            skip_store: false,
            response: None,
            repository,
        }
    }

    /// The key used for repository access.
    pub fn prefixed_key(&self) -> String {
        format!("{}{}", self.key_prefix, self.key)
    }

    /// Request host: the URI authority when present (absolute-form
    /// requests), otherwise the Host header.
    pub fn host(&self) -> String {
        if let Some(authority) = self.uri.authority() {
            return authority.to_string();
        }
        self.headers
            .get(http::header::HOST)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string()
    }

    /// Request scheme; ingress is plaintext, so this is `http` unless the
    /// URI carries its own scheme.
    pub fn scheme(&self) -> String {
        self.uri
            .scheme_str()
            .unwrap_or("http")
            .to_string()
    }
}

/// Errors returned by plugin hooks. `Status` carries an explicit HTTP
/// status for the client; everything else is reported as a 500.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("decode base64 body: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Key(#[from] crate::fingerprint::KeyError),

    #[error("{0}")]
    Other(String),
}

impl PluginError {
    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        PluginError::Status {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            PluginError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A plugin failure tagged with the name of the plugin that raised it.
#[derive(Debug, Error)]
#[error("plugin {plugin}: {source}")]
pub struct PipelineError {
    pub plugin: String,
    #[source]
    pub source: PluginError,
}

impl PipelineError {
    /// The HTTP status the handler should answer with: the plugin-provided
    /// status when one was attached, 500 otherwise.
    pub fn status(&self) -> StatusCode {
        self.source
            .status()
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// A pipeline hook. Both phases default to no-ops, so a plugin implements
/// only the capabilities it has.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Invoked after the fingerprint is built but before cache lookup.
    async fn on_request(&self, _ctx: &mut RequestContext) -> Result<(), PluginError> {
        Ok(())
    }

    /// Invoked just before a response is written to the client.
    async fn on_response(
        &self,
        _ctx: &mut RequestContext,
        _stored: &mut StoredResponse,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}

/// Loads a plugin's JSON config file.
pub(crate) fn plugin_config_from_file<T: serde::de::DeserializeOwned>(
    path: &str,
) -> Result<T, PluginError> {
    let data = std::fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

/// Runs every request-phase hook in declaration order. The first failure
/// aborts the pipeline.
pub async fn apply_request_plugins(
    plugins: &[Box<dyn Plugin>],
    ctx: &mut RequestContext,
) -> Result<(), PipelineError> {
    for plugin in plugins {
        plugin.on_request(ctx).await.map_err(|source| PipelineError {
            plugin: plugin.name().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Runs every response-phase hook in declaration order over `stored`.
pub async fn apply_response_plugins(
    plugins: &[Box<dyn Plugin>],
    ctx: &mut RequestContext,
    stored: &mut StoredResponse,
) -> Result<(), PipelineError> {
    for plugin in plugins {
        plugin
            .on_response(ctx, stored)
            .await
            .map_err(|source| PipelineError {
                plugin: plugin.name().to_string(),
                source,
            })?;
    }
    Ok(())
}
