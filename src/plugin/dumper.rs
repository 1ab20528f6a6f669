use std::fmt::Write as _;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::{Plugin, PluginError, RequestContext};
use crate::store::{Header, StoredResponse};

/// Response-phase traffic dumper. Level 0 writes request and response
/// lines plus headers; level 1 adds printable request bodies and textual
/// response bodies. Blocks are appended to the dump file by a background
/// writer task so hooks never wait on disk.
pub struct Dumper {
    level: u8,
    sender: mpsc::UnboundedSender<String>,
}

impl Dumper {
    pub fn new(path: &str, level: u8) -> Self {
        let level = if level > 1 { 0 } else { level };
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let path = path.to_string();

        tokio::spawn(async move {
            if let Some(parent) = std::path::Path::new(&path).parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await;

            match file {
                Ok(mut f) => {
                    info!("Dump writer started: {}", path);
                    while let Some(block) = receiver.recv().await {
                        if let Err(e) = f.write_all(block.as_bytes()).await {
                            error!("Failed to write dump block: {}", e);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to open dump file {}: {}", path, e);
                    // Drain the channel to avoid unbounded growth
                    while receiver.recv().await.is_some() {}
                }
            }
        });

        Self { level, sender }
    }

    fn format_block(&self, ctx: &RequestContext, stored: &StoredResponse) -> String {
        let mut out = String::new();
        let proto = format!("{:?}", ctx.version);
        let request_uri = match ctx.uri.path_and_query() {
            Some(pq) => pq.to_string(),
            None => ctx.uri.path().to_string(),
        };

        let _ = write!(out, "{} {} {}\r\n", ctx.method, request_uri, proto);
        let host = ctx.host();
        if !host.is_empty() {
            let _ = write!(out, "Host: {host}\r\n");
        }
        for (name, value) in &ctx.headers {
            let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
        }
        out.push_str("\r\n");

        if self.level == 1 && !ctx.body.is_empty() && is_printable(&ctx.body) {
            out.push_str(&String::from_utf8_lossy(&ctx.body));
            out.push_str("\r\n\r\n");
        }

        let reason = StatusCode::from_u16(stored.status_code)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("");
        let _ = write!(out, "{} {} {}\r\n", proto, stored.status_code, reason);
        for header in &stored.headers {
            let _ = write!(out, "{}: {}\r\n", header.key, header.value);
        }
        out.push_str("\r\n");

        if self.level == 1 && !stored.body_base64.is_empty() && is_text_headers(&stored.headers) {
            if let Ok(body) = STANDARD.decode(&stored.body_base64) {
                if !body.is_empty() {
                    out.push_str(&String::from_utf8_lossy(&body));
                    out.push_str("\r\n\r\n");
                }
            }
        }

        out.push_str("\r\n\r\n");
        out
    }
}

#[async_trait]
impl Plugin for Dumper {
    fn name(&self) -> &str {
        "dumper"
    }

    async fn on_response(
        &self,
        ctx: &mut RequestContext,
        stored: &mut StoredResponse,
    ) -> Result<(), PluginError> {
        let _ = self.sender.send(self.format_block(ctx, stored));
        Ok(())
    }
}

fn is_printable(content: &[u8]) -> bool {
    String::from_utf8_lossy(content)
        .chars()
        .all(|c| c.is_whitespace() || !c.is_control())
}

fn is_text_headers(headers: &[Header]) -> bool {
    headers.iter().any(|header| {
        header.key.eq_ignore_ascii_case("Content-Type") && {
            let content_type = header.value.to_lowercase();
            content_type.contains("text/")
                || content_type.contains("application/json")
                || content_type.contains("application/xml")
                || content_type.contains("application/javascript")
        }
    })
}
