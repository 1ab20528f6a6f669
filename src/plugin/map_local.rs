use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tracing::{info, warn};

use super::rules::MapFrom;
use super::{Plugin, PluginError, RequestContext};
use crate::store::StoredResponse;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MapLocalTo {
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MapLocalItem {
    pub from: Option<MapFrom>,
    pub to: Option<MapLocalTo>,
    pub enable: bool,
}

impl MapLocalItem {
    fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.enable {
            return false;
        }
        self.from.as_ref().is_some_and(|from| from.matches(ctx))
    }

    /// Resolves the mapped response. A target file is served directly; a
    /// target directory serves the request's sub-path beneath it (for
    /// `/*` source patterns, the sub-path is whatever the `*` matched).
    async fn response(&self, ctx: &RequestContext) -> (String, StoredResponse) {
        let Some(to) = self.to.as_ref() else {
            return (String::new(), status_response(500));
        };

        let (target, meta) = match stat(&to.path).await {
            Ok(meta) => (to.path.clone(), meta),
            Err(resp) => return (to.path.clone(), resp),
        };

        if !meta.is_dir() {
            return (target.clone(), read_file_response(&target).await);
        }

        let mut sub_path = ctx.uri.path().to_string();
        if let Some(from) = self.from.as_ref() {
            if !from.path.is_empty() && from.path.ends_with("/*") {
                sub_path = ctx
                    .uri
                    .path()
                    .get(from.path.len() - 2..)
                    .unwrap_or("")
                    .to_string();
            }
        }
        let file_path = join_under(&to.path, sub_path.trim_start_matches('/'));
        let display_path = file_path.display().to_string();

        let meta = match stat(&display_path).await {
            Ok(meta) => meta,
            Err(resp) => return (display_path, resp),
        };
        if !meta.is_dir() {
            return (display_path.clone(), read_file_response(&display_path).await);
        }
        warn!("map local {} should be a file", display_path);
        (display_path, status_response(500))
    }
}

/// Joins a request sub-path under a root, dropping `..` and `.` segments
/// so mapped requests cannot escape the configured directory.
fn join_under(root: &str, sub_path: &str) -> PathBuf {
    let mut joined = PathBuf::from(root);
    for component in Path::new(sub_path).components() {
        if let Component::Normal(part) = component {
            joined.push(part);
        }
    }
    joined
}

async fn stat(path: &str) -> Result<std::fs::Metadata, StoredResponse> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(status_response(404)),
        Err(err) => {
            warn!("map local {} stat error: {}", path, err);
            Err(status_response(500))
        }
    }
}

async fn read_file_response(path: &str) -> StoredResponse {
    match tokio::fs::read(path).await {
        Ok(body) => {
            let body_base64 = if body.is_empty() {
                String::new()
            } else {
                STANDARD.encode(&body)
            };
            StoredResponse {
                status_code: 200,
                headers: Vec::new(),
                body_base64,
            }
        }
        Err(err) => {
            warn!("map local {} read error: {}", path, err);
            status_response(500)
        }
    }
}

fn status_response(status_code: u16) -> StoredResponse {
    StoredResponse {
        status_code,
        ..Default::default()
    }
}

/// Request-phase plugin answering matching requests from the local
/// filesystem instead of cache or upstream.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MapLocal {
    pub name: String,
    pub enable: bool,
    pub items: Vec<MapLocalItem>,
}

impl MapLocal {
    pub fn from_file(path: &str) -> Result<Self, PluginError> {
        let map_local: MapLocal = super::plugin_config_from_file(path)?;
        map_local.validate()?;
        Ok(map_local)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        for (i, item) in self.items.iter().enumerate() {
            let Some(from) = item.from.as_ref() else {
                return Err(PluginError::Other(format!("item {i}: missing from")));
            };
            if !from.protocol.is_empty() && from.protocol != "http" && from.protocol != "https" {
                return Err(PluginError::Other(format!(
                    "item {i}: invalid from.protocol {}",
                    from.protocol
                )));
            }
            let Some(to) = item.to.as_ref() else {
                return Err(PluginError::Other(format!("item {i}: missing to")));
            };
            if to.path.is_empty() {
                return Err(PluginError::Other(format!("item {i}: empty to.path")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for MapLocal {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "map-local"
        } else {
            &self.name
        }
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        if !self.enable {
            return Ok(());
        }
        for item in &self.items {
            if item.matches(ctx) {
                let (local_file, response) = item.response(ctx).await;
                info!("map local {} to {}", ctx.uri, local_file);
                ctx.response = Some(response);
                return Ok(());
            }
        }
        Ok(())
    }
}
