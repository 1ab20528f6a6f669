use async_trait::async_trait;
use http::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::rules::RequestMatch;
use super::{Plugin, PluginError, RequestContext};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayRule {
    pub name: String,
    pub enable: bool,
    #[serde(rename = "match")]
    pub matcher: RequestMatch,
    pub always_upstream: bool,
    pub skip_replay: bool,
}

/// Request-phase cache lookup. Matching skip rules set `skip_cache`;
/// otherwise a repository hit populates `ctx.response` and marks the
/// request as a cache hit, short-circuiting the upstream fetch.
///
/// The shipped binary replays inside the request handler; this plugin is
/// the same behavior for embedders wiring their own pipeline.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ReplayPlugin {
    pub name: String,
    pub enable: bool,
    pub log_not_found: bool,
    pub rules: Vec<ReplayRule>,
}

impl ReplayPlugin {
    pub fn new() -> Self {
        Self {
            enable: true,
            ..Default::default()
        }
    }

    pub fn from_file(path: &str) -> Result<Self, PluginError> {
        super::plugin_config_from_file(path)
    }

    fn should_skip(&self, ctx: &RequestContext) -> bool {
        for rule in &self.rules {
            if !rule.enable || !rule.matcher.matches(ctx) {
                continue;
            }
            if rule.always_upstream || rule.skip_replay {
                let label = if rule.name.is_empty() { "unnamed" } else { &rule.name };
                debug!(rule = label, "replay rule: skip replay");
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl Plugin for ReplayPlugin {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "replay"
        } else {
            &self.name
        }
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        if !self.enable {
            return Ok(());
        }
        if self.should_skip(ctx) {
            ctx.skip_cache = true;
            return Ok(());
        }
        if ctx.skip_cache {
            return Ok(());
        }
        let Some(repository) = ctx.repository.clone() else {
            return Ok(());
        };

        let key = ctx.prefixed_key();
        match repository.get(&key).await {
            Ok(Some(stored)) => {
                ctx.cache_hit = true;
                ctx.response = Some(stored);
                Ok(())
            }
            Ok(None) => {
                if self.log_not_found {
                    debug!(%key, "cache miss");
                }
                Ok(())
            }
            // Lookup failures are a bad gateway regardless of which side of
            // the pipeline performs the lookup.
            Err(err) => Err(PluginError::with_status(
                StatusCode::BAD_GATEWAY,
                format!("lookup {key}: {err}"),
            )),
        }
    }
}
