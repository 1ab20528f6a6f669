//! Fingerprint scenarios: key layout, query permutation invariance, JSON
//! and form body canonicalization.

use http::{HeaderMap, HeaderValue, Method, Uri};
use replayd::fingerprint::build_key;

fn key(method: Method, uri: &str, content_type: Option<&str>, body: &[u8]) -> String {
    let uri: Uri = uri.parse().unwrap();
    let mut headers = HeaderMap::new();
    if let Some(content_type) = content_type {
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_str(content_type).unwrap(),
        );
    }
    build_key(&method, &uri, &headers, body).unwrap()
}

#[test]
fn get_key_is_path_method_sorted_query() {
    assert_eq!(
        key(Method::GET, "http://h/p?b=2&a=1", None, b""),
        "/p|GET|a=1&b=2"
    );
}

#[test]
fn empty_query_keeps_the_separator() {
    assert_eq!(key(Method::GET, "http://h/p", None, b""), "/p|GET|");
}

#[test]
fn json_body_is_canonicalized() {
    assert_eq!(
        key(
            Method::POST,
            "http://h/alpha?b=2&a=1",
            Some("application/json"),
            br#"{"b":2,"a":1}"#,
        ),
        r#"/alpha|POST|a=1&b=2|{"a":1,"b":2}"#
    );
}

#[test]
fn form_body_is_sorted_like_a_query() {
    assert_eq!(
        key(
            Method::POST,
            "http://h/form",
            Some("application/x-www-form-urlencoded"),
            b"b=2&a=1&a=0",
        ),
        "/form|POST||a=0&a=1&b=2"
    );
}

#[test]
fn key_is_stable_under_query_permutation() {
    let permutations = ["a=1&b=2&c=3", "c=3&a=1&b=2", "b=2&c=3&a=1"];
    let keys: Vec<String> = permutations
        .iter()
        .map(|q| key(Method::GET, &format!("http://h/p?{q}"), None, b""))
        .collect();
    assert!(keys.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn key_is_stable_under_json_reshaping() {
    let reshaped = [
        br#"{"a":[1,2],"b":{"x":1,"y":2}}"#.as_slice(),
        br#"{"b":{"y":2,"x":1},"a":[2,1]}"#.as_slice(),
        b"  {\"b\": {\"x\": 1, \"y\": 2}, \"a\": [2, 1]}  ".as_slice(),
    ];
    let keys: Vec<String> = reshaped
        .iter()
        .map(|body| key(Method::POST, "http://h/j", Some("application/json"), body))
        .collect();
    assert!(keys.windows(2).all(|pair| pair[0] == pair[1]));
}

#[test]
fn form_pairs_are_order_independent() {
    let left = key(
        Method::POST,
        "http://h/f",
        Some("application/x-www-form-urlencoded"),
        b"x=1&y=2",
    );
    let right = key(
        Method::POST,
        "http://h/f",
        Some("application/x-www-form-urlencoded"),
        b"y=2&x=1",
    );
    assert_eq!(left, right);
}

#[test]
fn non_ascii_json_is_escaped_in_the_key() {
    let got = key(
        Method::POST,
        "http://h/i18n",
        Some("application/json"),
        "{\"name\":\"café\"}".as_bytes(),
    );
    assert_eq!(got, r#"/i18n|POST||{"name":"caf\u00e9"}"#);
}

#[test]
fn other_content_types_contribute_no_body_segment() {
    assert_eq!(
        key(Method::POST, "http://h/bin", Some("application/octet-stream"), b"\x00\x01"),
        "/bin|POST|"
    );
    assert_eq!(key(Method::POST, "http://h/none", None, b"raw"), "/none|POST|");
}

#[test]
fn get_bodies_never_contribute() {
    assert_eq!(
        key(Method::GET, "http://h/g", Some("application/json"), br#"{"a":1}"#),
        "/g|GET|"
    );
}

#[test]
fn put_and_patch_bodies_contribute() {
    assert_eq!(
        key(Method::PUT, "http://h/u", Some("application/json"), br#"{"a":1}"#),
        r#"/u|PUT||{"a":1}"#
    );
    assert_eq!(
        key(Method::PATCH, "http://h/u", Some("application/json"), br#"{"a":1}"#),
        r#"/u|PATCH||{"a":1}"#
    );
}

#[test]
fn whitespace_only_bodies_are_ignored() {
    assert_eq!(
        key(Method::POST, "http://h/w", Some("application/json"), b"  \t\r\n "),
        "/w|POST|"
    );
}

#[test]
fn malformed_json_body_is_an_error() {
    let uri: Uri = "http://h/bad".parse().unwrap();
    let mut headers = HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    assert!(build_key(&Method::POST, &uri, &headers, b"{oops").is_err());
}

#[test]
fn percent_encoded_paths_are_decoded() {
    assert_eq!(
        key(Method::GET, "http://h/caf%C3%A9", None, b""),
        "/café|GET|"
    );
}

#[test]
fn trailing_slash_is_not_normalized() {
    assert_ne!(
        key(Method::GET, "http://h/p/", None, b""),
        key(Method::GET, "http://h/p", None, b"")
    );
}
