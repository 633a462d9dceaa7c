//! OpenAI-compatible `/v1/chat/completions` and `/v1/models` endpoints.
//!
//! The chat handler is where the whole pipeline composes: the inbound
//! conversation is rewritten for the upstream dialect, the upstream
//! stream is consumed into an answer buffer and a tool-payload buffer,
//! the safe-delta engine decides what to forward while the trigger
//! sentinel may still appear, and the extractors turn the finished
//! buffers into structured `tool_calls`.

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use futures_util::{stream, StreamExt};

use super::AppState;
use crate::models::{
    parse_model_name, ChatCompletionsChunk, ChatCompletionsChoice, ChatCompletionsRequest,
    ChatCompletionsResponse, ChatCompletionsUsage, ChatResponseMessage, ChunkChoice, ChunkDelta,
    Message, ModelObject, ModelsResponse, ToolCall, get_target_model, PUBLIC_MODELS,
    SEARCH_SUFFIX, THINKING_SUFFIX,
};
use crate::toolcall::drain::{drain_safe_answer_delta, drain_safe_answer_tail};
use crate::toolcall::extract::{
    extract_tool_calls_from_payload, is_tool_call_payload, parse_function_calls_xml,
};
use crate::toolcall::{merge_tool_calls, rewrite::preprocess_messages_for_tools};
use crate::upstream::{UpstreamDelta, UpstreamPhase};

/// Maximum body size for chat completions requests (512KB). Chat
/// histories with many tool turns can be much larger than typical
/// request bodies.
pub const CHAT_COMPLETIONS_MAX_BODY_SIZE: usize = 524_288;

// ══════════════════════════════════════════════════════════════════════════════
// HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// POST /v1/chat/completions — OpenAI-compatible chat endpoint.
pub async fn handle_chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    if body.len() > CHAT_COMPLETIONS_MAX_BODY_SIZE {
        return error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!(
                "Request body too large ({} bytes, max {})",
                body.len(),
                CHAT_COMPLETIONS_MAX_BODY_SIZE
            ),
            "invalid_request_error",
            "request_too_large",
        );
    }

    let request: ChatCompletionsRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!("/v1/chat/completions JSON parse error: {error}");
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("Invalid JSON body: {error}"),
                "invalid_request_error",
                "invalid_json",
            );
        }
    };

    if request.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "messages array must not be empty",
            "invalid_request_error",
            "invalid_messages",
        );
    }

    let (_, thinking, search) = parse_model_name(&request.model);
    let target_model = get_target_model(&request.model);
    let has_function_calling = !request.tools.is_empty();
    let trigger = state.trigger_signal.to_string();

    let rewritten: Vec<Message> = preprocess_messages_for_tools(
        &request.messages,
        &request.tools,
        request.tool_choice.as_ref(),
        &trigger,
    );

    tracing::debug!(
        model = %request.model,
        target = %target_model,
        thinking,
        search,
        tools = request.tools.len(),
        "proxying chat completion"
    );

    #[allow(clippy::cast_possible_truncation)]
    let prompt_tokens = rewritten.iter().map(|m| m.text().len() / 4).sum::<usize>() as u32;

    let upstream = match state
        .zai
        .open_chat_stream(rewritten, &target_model, thinking, search)
        .await
    {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::error!("upstream chat open failed: {error:#}");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "Upstream request failed",
                "server_error",
                "upstream_error",
            );
        }
    };

    if request.stream.unwrap_or(false) {
        handle_streaming(upstream, request.model, has_function_calling, trigger)
    } else {
        handle_non_streaming(
            upstream,
            request.model,
            has_function_calling,
            trigger,
            prompt_tokens,
        )
        .await
    }
}

/// GET /v1/models — list the public model names with their tag variants.
pub async fn handle_v1_models() -> impl IntoResponse {
    let created = unix_timestamp();
    let data = PUBLIC_MODELS
        .iter()
        .flat_map(|base| {
            [
                base.to_string(),
                format!("{base}{THINKING_SUFFIX}"),
                format!("{base}{SEARCH_SUFFIX}"),
                format!("{base}{THINKING_SUFFIX}{SEARCH_SUFFIX}"),
            ]
        })
        .map(|id| ModelObject {
            id,
            object: "model",
            created,
            owned_by: "z.ai",
        })
        .collect();

    Json(ModelsResponse {
        object: "list",
        data,
    })
}

// ══════════════════════════════════════════════════════════════════════════════
// STREAM ASSEMBLY
// ══════════════════════════════════════════════════════════════════════════════

/// Per-request accumulation state: the growing answer, the raw tool
/// payload frames, and the emission cursor into the answer.
#[derive(Default)]
struct Accumulator {
    answer: String,
    payload: String,
}

impl Accumulator {
    /// Route one upstream delta into the right buffer. Thinking-phase
    /// text never reaches the client; tool-call payload frames are kept
    /// apart from the answer so they can be parsed, not displayed.
    fn absorb(&mut self, delta: &UpstreamDelta) {
        if delta.text.is_empty() {
            return;
        }
        match delta.phase {
            UpstreamPhase::Answer => {
                if is_tool_call_payload(&delta.text) {
                    self.payload.push_str(&delta.text);
                } else {
                    self.answer.push_str(&delta.text);
                }
            }
            UpstreamPhase::ToolCall => self.payload.push_str(&delta.text),
            UpstreamPhase::Other => {
                if is_tool_call_payload(&delta.text) {
                    self.payload.push_str(&delta.text);
                }
            }
            UpstreamPhase::Thinking => {}
        }
    }

    /// Structured calls from both detection paths, deduplicated.
    fn collect_tool_calls(&self, trigger: &str) -> Vec<ToolCall> {
        let (calls, _) = parse_function_calls_xml(&self.answer, trigger);
        merge_tool_calls(calls, extract_tool_calls_from_payload(&self.payload))
    }
}

fn handle_streaming(
    mut upstream: impl futures_util::Stream<Item = crate::upstream::StreamResult<UpstreamDelta>>
        + Send
        + Unpin
        + 'static,
    model: String,
    has_function_calling: bool,
    trigger: String,
) -> Response {
    let request_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = unix_timestamp();

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, std::io::Error>>(100);

    tokio::spawn(async move {
        let mut acc = Accumulator::default();
        let mut emitted = 0usize;
        let mut first_chunk = true;
        let mut errored = false;

        let chunk_frame = |delta: ChunkDelta, finish: Option<&'static str>| {
            let chunk = ChatCompletionsChunk {
                id: request_id.clone(),
                object: "chat.completion.chunk",
                created,
                model: model.clone(),
                choices: vec![ChunkChoice {
                    index: 0,
                    delta,
                    finish_reason: finish,
                }],
            };
            let json = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
            Bytes::from(format!("data: {json}\n\n"))
        };

        while let Some(item) = upstream.next().await {
            match item {
                Ok(delta) => {
                    acc.absorb(&delta);

                    let step = drain_safe_answer_delta(
                        &acc.answer,
                        emitted,
                        has_function_calling,
                        &trigger,
                    );
                    emitted = step.emitted;
                    if !step.delta.is_empty() {
                        let role = first_chunk.then_some("assistant");
                        first_chunk = false;
                        let frame = chunk_frame(
                            ChunkDelta {
                                role,
                                content: Some(step.delta),
                                tool_calls: None,
                            },
                            None,
                        );
                        if tx.send(Ok(frame)).await.is_err() {
                            return; // client disconnected
                        }
                    }

                    if delta.is_final {
                        break;
                    }
                }
                Err(error) => {
                    errored = true;
                    tracing::error!("upstream stream error: {error}");
                    let frame = serde_json::json!({ "error": error.to_string() });
                    let _ = tx.send(Ok(Bytes::from(format!("data: {frame}\n\n")))).await;
                    break;
                }
            }
        }

        if !errored {
            let (tail, _) = drain_safe_answer_tail(&acc.answer, emitted, &trigger);
            if !tail.is_empty() {
                let role = first_chunk.then_some("assistant");
                first_chunk = false;
                let frame = chunk_frame(
                    ChunkDelta {
                        role,
                        content: Some(tail),
                        tool_calls: None,
                    },
                    None,
                );
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }

            let calls = acc.collect_tool_calls(&trigger);
            let role = first_chunk.then_some("assistant");
            let finish_frame = if calls.is_empty() {
                chunk_frame(
                    ChunkDelta {
                        role,
                        content: None,
                        tool_calls: None,
                    },
                    Some("stop"),
                )
            } else {
                chunk_frame(
                    ChunkDelta {
                        role,
                        content: None,
                        tool_calls: Some(calls),
                    },
                    Some("tool_calls"),
                )
            };
            if tx.send(Ok(finish_frame)).await.is_err() {
                return;
            }
        }

        let _ = tx.send(Ok(Bytes::from("data: [DONE]\n\n"))).await;
    });

    let body_stream = stream::unfold(rx, |mut rx| async { rx.recv().await.map(|b| (b, rx)) });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_non_streaming(
    mut upstream: impl futures_util::Stream<Item = crate::upstream::StreamResult<UpstreamDelta>>
        + Send
        + Unpin
        + 'static,
    model: String,
    has_function_calling: bool,
    trigger: String,
    prompt_tokens: u32,
) -> Response {
    let mut acc = Accumulator::default();

    while let Some(item) = upstream.next().await {
        match item {
            Ok(delta) => {
                acc.absorb(&delta);
                if delta.is_final {
                    break;
                }
            }
            Err(error) => {
                tracing::error!("upstream stream error: {error}");
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    "Upstream stream failed",
                    "server_error",
                    "upstream_error",
                );
            }
        }
    }

    let (content, _) = drain_safe_answer_tail(&acc.answer, 0, &trigger);
    let calls = if has_function_calling || !acc.payload.is_empty() {
        acc.collect_tool_calls(&trigger)
    } else {
        Vec::new()
    };

    #[allow(clippy::cast_possible_truncation)]
    let completion_tokens = (content.len() / 4) as u32;
    let finish_reason = if calls.is_empty() { "stop" } else { "tool_calls" };

    let response = ChatCompletionsResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        object: "chat.completion",
        created: unix_timestamp(),
        model,
        choices: vec![ChatCompletionsChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant",
                content: if content.is_empty() && !calls.is_empty() {
                    None
                } else {
                    Some(content)
                },
                tool_calls: calls,
            },
            finish_reason,
        }],
        usage: ChatCompletionsUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        },
    };

    (StatusCode::OK, Json(response)).into_response()
}

// ══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ══════════════════════════════════════════════════════════════════════════════

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn error_response(
    status: StatusCode,
    message: &str,
    error_type: &str,
    code: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": code,
        }
    });
    (status, Json(body)).into_response()
}
