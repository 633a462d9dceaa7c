//! OpenAI-compatible wire types and model-name handling.
//!
//! The request/response shapes mirror the public chat-completions API so
//! any OpenAI client can talk to this proxy unchanged. Model names carry
//! optional `-thinking` / `-search` tags that select upstream features and
//! are stripped before alias resolution.

use serde::{Deserialize, Serialize};

/// Suffix enabling the upstream thinking (reasoning) mode.
pub const THINKING_SUFFIX: &str = "-thinking";
/// Suffix enabling the upstream web-search mode.
pub const SEARCH_SUFFIX: &str = "-search";

// ══════════════════════════════════════════════════════════════════════════════
// MESSAGES AND TOOLS
// ══════════════════════════════════════════════════════════════════════════════

/// A chat message as clients send it. `content` may be a plain string, a
/// list of typed parts, or any other JSON value; all three survive a
/// round trip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Some(MessageContent::Text(content.into())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    /// Flatten the message body to plain text: strings pass through,
    /// part lists concatenate their `text` parts, anything else is
    /// JSON-encoded.
    pub fn text(&self) -> String {
        match &self.content {
            None => String::new(),
            Some(content) => content.text(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<serde_json::Value>),
    Other(serde_json::Value),
}

impl MessageContent {
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter(|part| {
                        part.get("type").and_then(serde_json::Value::as_str) == Some("text")
                    })
                    .filter_map(|part| part.get("text").and_then(serde_json::Value::as_str))
                    .collect();
                texts.join(" ").trim().to_string()
            }
            Self::Other(value) => serde_json::to_string(value).unwrap_or_default(),
        }
    }
}

/// A tool invocation attributed to the assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolCallFunction {
    #[serde(default)]
    pub name: String,
    /// Always the JSON textual form of an object once normalized.
    #[serde(default)]
    pub arguments: String,
}

/// A function made available to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// `tool_choice` as OpenAI defines it: a mode string or a specific
/// function selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Function(ToolChoiceSelection),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceSelection {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub function: ToolChoiceFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

// ══════════════════════════════════════════════════════════════════════════════
// CHAT COMPLETIONS ENVELOPE
// ══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct ChatCompletionsRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatCompletionsChoice>,
    pub usage: ChatCompletionsUsage,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsChoice {
    pub index: u32,
    pub message: ChatResponseMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChatResponseMessage {
    pub role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionsUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// SSE streaming chunk format.
#[derive(Debug, Serialize)]
pub struct ChatCompletionsChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

// ══════════════════════════════════════════════════════════════════════════════
// MODEL NAMES
// ══════════════════════════════════════════════════════════════════════════════

/// Public model names exposed on `/v1/models`, in announcement order.
pub const PUBLIC_MODELS: &[&str] = &["GLM-4.5", "GLM-4.5-Air", "GLM-4.6"];

/// Strip trailing `-thinking` and/or `-search` tags (either order) and
/// report which features they request.
pub fn parse_model_name(model: &str) -> (String, bool, bool) {
    let mut base = model.trim();
    let mut thinking = false;
    let mut search_mode = false;

    loop {
        if let Some(stripped) = base.strip_suffix(THINKING_SUFFIX) {
            thinking = true;
            base = stripped;
            continue;
        }
        if let Some(stripped) = base.strip_suffix(SEARCH_SUFFIX) {
            search_mode = true;
            base = stripped;
            continue;
        }
        break;
    }

    (base.to_string(), thinking, search_mode)
}

/// Upstream model id for a public base name, if the alias table knows it.
fn model_alias(base: &str) -> Option<&'static str> {
    match base.to_ascii_lowercase().as_str() {
        "glm-4.5" => Some("0727-360B-API"),
        "glm-4.5-air" => Some("0727-106B-API"),
        "glm-4.6" => Some("GLM-4-6-API-V1"),
        _ => None,
    }
}

/// Resolve the model id to send upstream: strip tags, then consult the
/// alias table; on a miss the base name is forwarded as-is.
pub fn get_target_model(model: &str) -> String {
    let (base, _, _) = parse_model_name(model);
    match model_alias(&base) {
        Some(alias) => alias.to_string(),
        None => base,
    }
}
