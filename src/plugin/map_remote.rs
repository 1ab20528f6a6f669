use async_trait::async_trait;
use http::uri::{Authority, PathAndQuery, Scheme, Uri};
use http::HeaderValue;
use serde::Deserialize;
use tracing::info;

use super::rules::MapFrom;
use super::{Plugin, PluginError, RequestContext};
use crate::fingerprint::build_key;

// Path map rule:
//   1. from.path /hello and to.path /world
//     /hello => /world
//   2. from.path /hello/* and to.path /world
//     /hello => /world
//     /hello/abc => /world/abc

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MapRemoteTo {
    pub protocol: String,
    pub host: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MapRemoteItem {
    pub from: Option<MapFrom>,
    pub to: Option<MapRemoteTo>,
    pub enable: bool,
}

impl MapRemoteItem {
    fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.enable {
            return false;
        }
        self.from.as_ref().is_some_and(|from| from.matches(ctx))
    }

    /// Rewrites scheme, host and path on the context, then recomputes the
    /// fingerprint so lookup and store see the mapped request.
    fn replace(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        let Some(to) = self.to.as_ref() else {
            return Ok(());
        };

        let mut scheme: Option<Scheme> = ctx.uri.scheme().cloned();
        if !to.protocol.is_empty() {
            scheme = Some(
                to.protocol
                    .parse::<Scheme>()
                    .map_err(|_| PluginError::Other(format!("invalid protocol {}", to.protocol)))?,
            );
        }

        let mut authority: Option<Authority> = ctx.uri.authority().cloned();
        if !to.host.is_empty() {
            let parsed = to
                .host
                .parse::<Authority>()
                .map_err(|_| PluginError::Other(format!("invalid host {}", to.host)))?;
            if let Ok(value) = HeaderValue::from_str(&to.host) {
                ctx.headers.insert(http::header::HOST, value);
            }
            authority = Some(parsed);
        }

        let mut path = ctx.uri.path().to_string();
        if !to.path.is_empty() {
            let from_path = self
                .from
                .as_ref()
                .map(|from| from.path.as_str())
                .unwrap_or("");
            if !from_path.is_empty() && from_path.ends_with("/*") {
                let sub_path = ctx.uri.path().get(from_path.len() - 2..).unwrap_or("");
                path = join_url_path(&to.path, sub_path);
            } else {
                path = join_url_path(&to.path, "");
            }
        }

        let path_and_query = match ctx.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };
        let path_and_query = path_and_query
            .parse::<PathAndQuery>()
            .map_err(|err| PluginError::Other(format!("rebuild path: {err}")))?;

        let mut parts = http::uri::Parts::default();
        // An authority-form URI needs a scheme too.
        if let Some(authority) = authority {
            parts.scheme = Some(scheme.unwrap_or(Scheme::HTTP));
            parts.authority = Some(authority);
        }
        parts.path_and_query = Some(path_and_query);
        ctx.uri = Uri::from_parts(parts)
            .map_err(|err| PluginError::Other(format!("rebuild uri: {err}")))?;

        ctx.key = build_key(&ctx.method, &ctx.uri, &ctx.headers, &ctx.body)?;
        Ok(())
    }
}

/// Joins URL path segments under a leading `/`, collapsing duplicate
/// separators.
fn join_url_path(base: &str, sub_path: &str) -> String {
    let mut joined = String::from("/");
    for segment in base.split('/').chain(sub_path.split('/')) {
        if segment.is_empty() {
            continue;
        }
        if !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(segment);
    }
    joined
}

/// Request-phase plugin redirecting matching requests to another origin
/// and/or path before fingerprinting and upstream fetch.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MapRemote {
    pub name: String,
    pub enable: bool,
    pub items: Vec<MapRemoteItem>,
}

impl MapRemote {
    pub fn from_file(path: &str) -> Result<Self, PluginError> {
        let map_remote: MapRemote = super::plugin_config_from_file(path)?;
        map_remote.validate()?;
        Ok(map_remote)
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
            if to.protocol.is_empty() && to.host.is_empty() && to.path.is_empty() {
                return Err(PluginError::Other(format!("item {i}: empty to")));
            }
            if !to.protocol.is_empty() && to.protocol != "http" && to.protocol != "https" {
                return Err(PluginError::Other(format!(
                    "item {i}: invalid to.protocol {}",
                    to.protocol
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for MapRemote {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "map-remote"
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
                let before = ctx.uri.to_string();
                item.replace(ctx)?;
                info!("map remote {} to {}", before, ctx.uri);
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_url_paths() {
        assert_eq!(join_url_path("/world", ""), "/world");
        assert_eq!(join_url_path("world", "/abc"), "/world/abc");
        assert_eq!(join_url_path("/world/", "abc/def"), "/world/abc/def");
    }
}
