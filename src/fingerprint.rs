use std::fmt::Write as _;

use http::{HeaderMap, Method, Uri};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use thiserror::Error;
use url::form_urlencoded;

/// Failure to derive a fingerprint from a request. Only JSON bodies can
/// fail: query strings are decoded lossily and never error.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("canonicalize json body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Computes the deterministic cache key for a request and its buffered body.
///
/// The key is `path|METHOD|sortedQuery`, extended with `|canonicalBody` for
/// POST/PUT/PATCH requests carrying a JSON or form-urlencoded body. Two
/// requests that differ only in query-pair order, JSON object key order, or
/// JSON array element order (arrays are compared as multisets) collide on
/// the same key.
pub fn build_key(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, KeyError> {
    // hyper hands us the encoded path; the key space uses the decoded form.
    let path = percent_decode_str(uri.path())
        .decode_utf8_lossy()
        .into_owned();
    let sorted_query = sort_query_params(uri.query().unwrap_or(""));

    let mut parts = vec![path, method.to_string(), sorted_query];

    if *method == Method::POST || *method == Method::PUT || *method == Method::PATCH {
        let trimmed = body.trim_ascii();
        if !trimmed.is_empty() {
            let content_type = headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("");
            if content_type.contains("application/json") {
                parts.push(canonical_json(trimmed)?);
            } else if content_type.contains("application/x-www-form-urlencoded") {
                parts.push(sort_query_params(&String::from_utf8_lossy(trimmed)));
            }
        }
    }

    Ok(parts.join("|"))
}

/// Canonicalizes a raw query string: pairs are decoded (duplicates kept, a
/// missing `=` yields an empty value), sorted ascending by `(name, value)`,
/// and re-encoded. An empty query yields an empty string.
pub fn sort_query_params(raw_query: &str) -> String {
    if raw_query.is_empty() {
        return String::new();
    }

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(raw_query.as_bytes())
        .into_owned()
        .collect();
    // Vec::sort_by is stable, so equal pairs keep their arrival order.
    pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    encode_query_pairs(&pairs)
}

fn encode_query_pairs(pairs: &[(String, String)]) -> String {
    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (name, value) in pairs {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

/// Canonical JSON encoding of a body: object keys in ascending byte order,
/// arrays sorted by the canonical encoding of their elements, numbers kept
/// as their literal decimal text, compact output, everything above U+007F
/// escaped as `\uXXXX`.
pub fn canonical_json(body: &[u8]) -> Result<String, serde_json::Error> {
    let value: Value = serde_json::from_slice(body)?;
    let normalized = normalize_json(value);
    let encoded = serde_json::to_string(&normalized)?;
    Ok(escape_json_ascii(&encoded))
}

/// Recursively rewrites a JSON value into its canonical shape. Object maps
/// already iterate in ascending key order; arrays are sorted by each
/// element's canonical encoding, which deliberately treats them as
/// multisets.
fn normalize_json(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, item)| (key, normalize_json(item)))
                .collect(),
        ),
        Value::Array(items) => {
            let mut keyed: Vec<(String, Value)> = items
                .into_iter()
                .map(|item| {
                    let normalized = normalize_json(item);
                    (canonical_json_string(&normalized), normalized)
                })
                .collect();
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Array(keyed.into_iter().map(|(_, item)| item).collect())
        }
        other => other,
    }
}

fn canonical_json_string(value: &Value) -> String {
    let encoded = serde_json::to_string(value).unwrap_or_default();
    escape_json_ascii(&encoded)
}

/// Escapes every code point above U+007F as `\uXXXX`, using surrogate
/// pairs for supplementary-plane characters.
fn escape_json_ascii(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if (ch as u32) <= 0x7f {
            out.push(ch);
            continue;
        }
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            let _ = write!(out, "\\u{unit:04x}");
        }
    }
    out
}
