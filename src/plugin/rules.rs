use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{Plugin, PluginError, RequestContext};
use crate::fingerprint::sort_query_params;

/// Predicate over a request. Empty criteria are wildcards; all present
/// criteria must match.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestMatch {
    /// Set membership over the request method. Empty matches everything.
    pub method: Vec<String>,
    /// Exact host match.
    pub host: String,
    /// Glob over the request path (`?` one character, `*` any run).
    pub path: String,
    /// Glob over the canonical URL `scheme://host/path?sortedQuery`.
    pub url: String,
    /// Case-insensitive name lookup, case-insensitive substring match over
    /// the values.
    pub header: HashMap<String, String>,
    /// Byte-wise substring of the buffered request body.
    pub body_contains: String,
}

impl RequestMatch {
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.method.is_empty() && !self.method.iter().any(|m| m == ctx.method.as_str()) {
            return false;
        }
        if !self.host.is_empty() && self.host != ctx.host() {
            return false;
        }
        if !self.path.is_empty() && !glob_match(&self.path, ctx.uri.path()) {
            return false;
        }
        if !self.url.is_empty() && !glob_match(&self.url, &canonical_request_url(ctx)) {
            return false;
        }
        if !self.header.is_empty() && !headers_match(ctx, &self.header) {
            return false;
        }
        if !self.body_contains.is_empty()
            && !contains_bytes(&ctx.body, self.body_contains.as_bytes())
        {
            return false;
        }
        true
    }
}

fn headers_match(ctx: &RequestContext, matchers: &HashMap<String, String>) -> bool {
    for (key, expected) in matchers {
        if expected.is_empty() {
            continue;
        }
        let expected = expected.to_lowercase();
        let found = ctx
            .headers
            .get_all(key.as_str())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.to_lowercase().contains(&expected));
        if !found {
            return false;
        }
    }
    true
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// The URL form rule globs are evaluated against: the query is
/// canonicalized so rules match regardless of pair order on the wire.
pub fn canonical_request_url(ctx: &RequestContext) -> String {
    let host = ctx.host();
    let path = ctx.uri.path();
    let query = sort_query_params(ctx.uri.query().unwrap_or(""));

    if host.is_empty() {
        if query.is_empty() {
            return path.to_string();
        }
        return format!("{path}?{query}");
    }
    let scheme = ctx.scheme();
    if query.is_empty() {
        return format!("{scheme}://{host}{path}");
    }
    format!("{scheme}://{host}{path}?{query}")
}

/// Glob matcher supporting `?` (exactly one character) and `*` (any run,
/// including empty).
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < text.len() {
        if pi < pattern.len() && (pattern[pi] == '?' || pattern[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pattern.len() && pattern[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(star_at) = star {
            // Backtrack: let the last star swallow one more character.
            pi = star_at + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < pattern.len() && pattern[pi] == '*' {
        pi += 1;
    }
    pi == pattern.len()
}

/// Source matcher shared by the mapping plugins: scheme, exact host,
/// method set and path glob.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MapFrom {
    pub protocol: String,
    pub host: String,
    pub method: Vec<String>,
    pub path: String,
}

impl MapFrom {
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        if !self.protocol.is_empty() && self.protocol != ctx.scheme() {
            return false;
        }
        if !self.host.is_empty() && self.host != ctx.host() {
            return false;
        }
        if !self.method.is_empty() && !self.method.iter().any(|m| m == ctx.method.as_str()) {
            return false;
        }
        if !self.path.is_empty() && !glob_match(&self.path, ctx.uri.path()) {
            return false;
        }
        true
    }
}

/// A single bypass rule. The first enabled rule whose match succeeds is
/// applied; later rules are not consulted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub name: String,
    pub enable: bool,
    #[serde(rename = "match")]
    pub matcher: RequestMatch,
    /// Force the request past both cache lookup and store.
    pub always_upstream: bool,
    pub skip_cache: bool,
    pub skip_store: bool,
}

impl Rule {
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            "unnamed"
        } else {
            &self.name
        }
    }
}

/// Request-phase plugin applying ordered bypass rules, loaded from a JSON
/// config file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub name: String,
    pub enable: bool,
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn from_file(path: &str) -> Result<Self, PluginError> {
        super::plugin_config_from_file(path)
    }
}

#[async_trait]
impl Plugin for RuleSet {
    fn name(&self) -> &str {
        if self.name.is_empty() {
            "record-replay"
        } else {
            &self.name
        }
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> Result<(), PluginError> {
        if !self.enable {
            return Ok(());
        }
        for rule in &self.rules {
            if !rule.enable || !rule.matcher.matches(ctx) {
                continue;
            }
            if rule.always_upstream {
                ctx.skip_cache = true;
                ctx.skip_store = true;
                debug!(rule = rule.label(), "bypass rule: force upstream");
            } else {
                if rule.skip_cache {
                    ctx.skip_cache = true;
                }
                if rule.skip_store {
                    ctx.skip_store = true;
                }
                debug!(
                    rule = rule.label(),
                    skip_cache = ctx.skip_cache,
                    skip_store = ctx.skip_store,
                    "bypass rule applied"
                );
            }
            return Ok(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method, Uri};

    fn context(method: Method, uri: &str, body: &[u8]) -> RequestContext {
        let uri: Uri = uri.parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("api.example.com"));
        headers.insert("x-env", HeaderValue::from_static("Staging-West"));
        RequestContext::new(
            method,
            uri,
            headers,
            Bytes::copy_from_slice(body),
            String::new(),
            String::new(),
            http::Version::HTTP_11,
            None,
        )
    }

    #[test]
    fn glob_wildcards() {
        assert!(glob_match("/api/*", "/api/users/42"));
        assert!(glob_match("/api/?", "/api/x"));
        assert!(!glob_match("/api/?", "/api/xy"));
        assert!(glob_match("*", "/anything"));
        assert!(glob_match("/a*c", "/abbbc"));
        assert!(!glob_match("/a*c", "/abbd"));
    }

    #[test]
    fn empty_match_is_a_wildcard() {
        let ctx = context(Method::GET, "/whatever", b"");
        assert!(RequestMatch::default().matches(&ctx));
    }

    #[test]
    fn method_set_membership() {
        let ctx = context(Method::POST, "/x", b"");
        let matcher = RequestMatch {
            method: vec!["GET".to_string(), "POST".to_string()],
            ..Default::default()
        };
        assert!(matcher.matches(&ctx));
        let matcher = RequestMatch {
            method: vec!["DELETE".to_string()],
            ..Default::default()
        };
        assert!(!matcher.matches(&ctx));
    }

    #[test]
    fn header_match_is_case_insensitive_substring() {
        let ctx = context(Method::GET, "/x", b"");
        let mut header = HashMap::new();
        header.insert("X-ENV".to_string(), "staging".to_string());
        let matcher = RequestMatch {
            header,
            ..Default::default()
        };
        assert!(matcher.matches(&ctx));
    }

    #[test]
    fn body_contains_is_byte_wise() {
        let ctx = context(Method::POST, "/x", b"hello world");
        let matcher = RequestMatch {
            body_contains: "lo wo".to_string(),
            ..Default::default()
        };
        assert!(matcher.matches(&ctx));
    }

    #[test]
    fn url_glob_sees_the_canonical_query() {
        let ctx = context(Method::GET, "/search?b=2&a=1", b"");
        let matcher = RequestMatch {
            url: "http://api.example.com/search?a=1&b=2".to_string(),
            ..Default::default()
        };
        assert!(matcher.matches(&ctx));
    }

    #[tokio::test]
    async fn first_matching_rule_wins() {
        let rules = RuleSet {
            name: String::new(),
            enable: true,
            rules: vec![
                Rule {
                    name: "skip-cache-on-api".to_string(),
                    enable: true,
                    matcher: RequestMatch {
                        path: "/api/*".to_string(),
                        ..Default::default()
                    },
                    skip_cache: true,
                    ..Default::default()
                },
                Rule {
                    name: "never-reached".to_string(),
                    enable: true,
                    matcher: RequestMatch::default(),
                    skip_store: true,
                    ..Default::default()
                },
            ],
        };

        let mut ctx = context(Method::GET, "/api/users", b"");
        rules.on_request(&mut ctx).await.unwrap();
        assert!(ctx.skip_cache);
        assert!(!ctx.skip_store);
    }

    #[tokio::test]
    async fn always_upstream_sets_both_flags() {
        let rules = RuleSet {
            name: String::new(),
            enable: true,
            rules: vec![Rule {
                name: "live".to_string(),
                enable: true,
                matcher: RequestMatch::default(),
                always_upstream: true,
                ..Default::default()
            }],
        };
        let mut ctx = context(Method::GET, "/", b"");
        rules.on_request(&mut ctx).await.unwrap();
        assert!(ctx.skip_cache && ctx.skip_store);
    }
}
