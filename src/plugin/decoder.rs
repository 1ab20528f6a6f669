use std::io::Read;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::{GzDecoder, ZlibDecoder};

use super::{Plugin, PluginError, RequestContext};
use crate::store::StoredResponse;

/// Response-phase hook decoding common content-encodings before a stored
/// body reaches the client. The `Content-Encoding` header is removed when
/// the whole chain is consumed, otherwise rewritten with the tokens this
/// decoder does not understand, in their original order.
#[derive(Debug, Default)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Plugin for Decoder {
    fn name(&self) -> &str {
        "decoder"
    }

    async fn on_response(
        &self,
        _ctx: &mut RequestContext,
        stored: &mut StoredResponse,
    ) -> Result<(), PluginError> {
        if stored.body_base64.is_empty() {
            return Ok(());
        }
        let Some(encoding_header) = stored.header("Content-Encoding").map(str::to_string) else {
            return Ok(());
        };
        let encodings = parse_header_tokens(&encoding_header);
        if encodings.is_empty() {
            return Ok(());
        }

        let body = STANDARD.decode(&stored.body_base64)?;
        let (decoded, remaining) = decode_body(body, &encodings)?;

        stored.body_base64 = STANDARD.encode(&decoded);
        if remaining.is_empty() {
            stored.remove_header("Content-Encoding");
        } else {
            stored.set_header("Content-Encoding", remaining.join(", "));
        }
        Ok(())
    }
}

/// Applies the codec chain outer→inner in list order. Known codecs are
/// consumed; unknown tokens are collected and survive in the rewritten
/// header. `identity` is a no-op.
fn decode_body(body: Vec<u8>, encodings: &[String]) -> Result<(Vec<u8>, Vec<String>), PluginError> {
    let mut remaining = Vec::new();
    let mut current = body;
    for encoding in encodings {
        match encoding.to_lowercase().as_str() {
            "gzip" => current = decode_gzip(&current)?,
            "deflate" => current = decode_deflate(&current)?,
            "identity" | "" => continue,
            _ => remaining.push(encoding.clone()),
        }
    }
    Ok((current, remaining))
}

fn decode_gzip(body: &[u8]) -> Result<Vec<u8>, PluginError> {
    let mut out = Vec::new();
    GzDecoder::new(body).read_to_end(&mut out)?;
    Ok(out)
}

// deflate on the wire is zlib-wrapped.
fn decode_deflate(body: &[u8]) -> Result<Vec<u8>, PluginError> {
    let mut out = Vec::new();
    ZlibDecoder::new(body).read_to_end(&mut out)?;
    Ok(out)
}

fn parse_header_tokens(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}
