use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use super::rules::RequestMatch;
use super::{Plugin, PluginError, RequestContext};
use crate::store::StoredResponse;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RecordRule {
    pub name: String,
    pub enable: bool,
    #[serde(rename = "match")]
    pub matcher: RequestMatch,
    pub always_upstream: bool,
    pub skip_store: bool,
}

fn default_ignore_statuses() -> Vec<u16> {
    vec![429]
}

/// Response-phase cache write. Replayed responses, skip-store requests,
/// ignored statuses and rule matches are left unstored; everything else is
/// persisted under the prefixed key. Write failures are logged and never
/// fail the response.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RecordPlugin {
    pub name: String,
    pub enable: bool,
    pub overwrite: bool,
    pub ignore_status_codes: Vec<u16>,
    pub rules: Vec<RecordRule>,
}

impl Default for RecordPlugin {
    fn default() -> Self {
        Self {
            name: String::new(),
            enable: false,
            overwrite: false,
            ignore_status_codes: default_ignore_statuses(),
            rules: Vec::new(),
        }
    }
}

impl RecordPlugin {
    pub fn new(overwrite: bool) -> Self {
        Self {
            enable: true,
            overwrite,
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
            if rule.always_upstream || rule.skip_store {
                let label = if rule.name.is_empty() { "unnamed" } else { &rule.name };
                debug!(rule = label, "record rule: skip store");
                return true;
            }
        }
        false
    }
}

#[async_trait]
impl Plugin for RecordPlugin {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "record"
        } else {
            &self.name
        }
    }

    async fn on_response(
        &self,
        ctx: &mut RequestContext,
        stored: &mut StoredResponse,
    ) -> Result<(), PluginError> {
        if !self.enable {
            return Ok(());
        }
        if ctx.cache_hit || ctx.skip_store {
            return Ok(());
        }
        if self.ignore_status_codes.contains(&stored.status_code) {
            return Ok(());
        }
        if self.should_skip(ctx) {
            return Ok(());
        }
        let Some(repository) = ctx.repository.clone() else {
            return Ok(());
        };

        let key = ctx.prefixed_key();
        match repository.set(&key, stored, self.overwrite).await {
            Ok(()) => debug!(%key, "stored response"),
            Err(err) => warn!(%key, error = %err, "store failed"),
        }
        Ok(())
    }
}
