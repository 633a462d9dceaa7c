//! Upstream z.ai chat client.
//!
//! Opens the streaming chat endpoint on the web frontend with an anonymous
//! bearer token and turns its SSE frames into a typed delta stream. The
//! upstream tags each frame with a phase (`thinking`, `answer`,
//! `tool_call`, …); routing of those phases into answer text versus
//! tool-call payload is the gateway's concern, this module only decodes.

use anyhow::{bail, Context, Result};
use futures_util::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::AnonymousTokenCache;
use crate::config::HttpClients;
use crate::models::Message;
use crate::util::truncate_with_ellipsis;

/// Streaming chat endpoint on the z.ai web frontend.
pub const UPSTREAM_CHAT_URL: &str = "https://chat.z.ai/api/chat/completions";

/// Browser-like User-Agent; the web frontend rejects obviously
/// non-browser clients.
const UPSTREAM_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

/// Errors produced while decoding the upstream stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upstream error: {0}")]
    Upstream(String),
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

/// Which channel of the upstream response a delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamPhase {
    Thinking,
    Answer,
    ToolCall,
    Other,
}

/// One decoded upstream frame.
#[derive(Debug, Clone)]
pub struct UpstreamDelta {
    pub phase: UpstreamPhase,
    pub text: String,
    pub is_final: bool,
}

impl UpstreamDelta {
    fn final_marker() -> Self {
        Self {
            phase: UpstreamPhase::Other,
            text: String::new(),
            is_final: true,
        }
    }
}

#[derive(Debug, Serialize)]
struct UpstreamChatRequest {
    stream: bool,
    model: String,
    messages: Vec<Message>,
    features: UpstreamFeatures,
    chat_id: String,
    id: String,
}

#[derive(Debug, Serialize)]
struct UpstreamFeatures {
    enable_thinking: bool,
    web_search: bool,
    auto_web_search: bool,
}

#[derive(Debug, Deserialize)]
struct UpstreamEvent {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    data: Option<UpstreamEventData>,
}

#[derive(Debug, Default, Deserialize)]
struct UpstreamEventData {
    #[serde(default)]
    phase: Option<String>,
    #[serde(default)]
    delta_content: Option<String>,
    #[serde(default)]
    edit_content: Option<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Client for the upstream chat surface. Holds the shared outbound
/// clients and the anonymous token cache; cheap to clone via `Arc`s.
pub struct ZaiClient {
    http: Arc<HttpClients>,
    tokens: Arc<AnonymousTokenCache>,
}

impl ZaiClient {
    pub fn new(http: Arc<HttpClients>, tokens: Arc<AnonymousTokenCache>) -> Self {
        Self { http, tokens }
    }

    /// Open an upstream chat stream for an already-rewritten message list.
    /// `target_model` is the upstream model id; `thinking` / `search`
    /// toggle the corresponding upstream features.
    pub async fn open_chat_stream(
        &self,
        messages: Vec<Message>,
        target_model: &str,
        thinking: bool,
        search: bool,
    ) -> Result<impl Stream<Item = StreamResult<UpstreamDelta>> + Send + Unpin + 'static> {
        let token = self.tokens.get_token(&self.http).await?;

        let request = UpstreamChatRequest {
            stream: true,
            model: target_model.to_string(),
            messages,
            features: UpstreamFeatures {
                enable_thinking: thinking,
                web_search: search,
                auto_web_search: search,
            },
            chat_id: "local".to_string(),
            id: uuid::Uuid::new_v4().to_string(),
        };

        // Same credential, same outbound path: the upstream's risk engine
        // dislikes a token hopping between source addresses.
        let response = self
            .http
            .sticky_client(&token)
            .post(UPSTREAM_CHAT_URL)
            .bearer_auth(&token)
            .header(reqwest::header::USER_AGENT, UPSTREAM_USER_AGENT)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await
            .context("upstream chat request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "upstream chat endpoint returned {status}: {}",
                truncate_with_ellipsis(&body, 300)
            );
        }

        Ok(sse_delta_stream(response))
    }
}

/// Convert the SSE byte stream into decoded deltas. Bytes are buffered
/// until a full line is available, so multi-byte characters split across
/// network chunks are never cut.
fn sse_delta_stream(
    response: reqwest::Response,
) -> impl Stream<Item = StreamResult<UpstreamDelta>> + Send + Unpin + 'static {
    let (tx, rx) = tokio::sync::mpsc::channel::<StreamResult<UpstreamDelta>>(100);

    tokio::spawn(async move {
        let mut buffer: Vec<u8> = Vec::new();
        let mut bytes_stream = response.bytes_stream();

        while let Some(item) = bytes_stream.next().await {
            let bytes = match item {
                Ok(bytes) => bytes,
                Err(error) => {
                    let _ = tx.send(Err(StreamError::Http(error))).await;
                    return;
                }
            };
            buffer.extend_from_slice(&bytes);

            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);

                match parse_sse_line(&line) {
                    Ok(Some(delta)) => {
                        let is_final = delta.is_final;
                        if tx.send(Ok(delta)).await.is_err() {
                            return; // client went away
                        }
                        if is_final {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(error) => {
                        let _ = tx.send(Err(error)).await;
                        return;
                    }
                }
            }
        }

        // Upstream closed without [DONE]; synthesize the final marker so
        // downstream always sees a terminated stream.
        let _ = tx.send(Ok(UpstreamDelta::final_marker())).await;
    });

    stream::unfold(rx, |mut rx| async { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

/// Decode one SSE line. Returns `None` for keep-alives, comments and
/// frames carrying no delta.
fn parse_sse_line(line: &str) -> StreamResult<Option<UpstreamDelta>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();

    if data == "[DONE]" {
        return Ok(Some(UpstreamDelta::final_marker()));
    }

    let event: UpstreamEvent = serde_json::from_str(data)?;
    if event.kind.as_deref() == Some("error") {
        return Err(StreamError::Upstream(
            event
                .data
                .and_then(|d| d.error)
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unspecified upstream error".to_string()),
        ));
    }

    let Some(data) = event.data else {
        return Ok(None);
    };

    if let Some(error) = data.error {
        return Err(StreamError::Upstream(error.to_string()));
    }

    let phase = match data.phase.as_deref() {
        Some("thinking") => UpstreamPhase::Thinking,
        Some("tool_call") => UpstreamPhase::ToolCall,
        Some("answer") | None => UpstreamPhase::Answer,
        Some(_) => UpstreamPhase::Other,
    };

    let text = data
        .delta_content
        .or(data.edit_content)
        .unwrap_or_default();

    if text.is_empty() && !data.done {
        return Ok(None);
    }

    Ok(Some(UpstreamDelta {
        phase,
        text,
        is_final: data.done,
    }))
}
