//! Tool-call recovery from model output and raw upstream payloads.
//!
//! Two entry points over the same call type: [`parse_function_calls_xml`]
//! reads the in-band XML grammar out of a finished answer, and
//! [`extract_tool_calls_from_payload`] scavenges structured calls out of
//! arbitrary upstream frames (JSON `tool_calls` arrays, legacy
//! `function_call` objects, and `<glm_block>` markup). The XML grammar is
//! flat, so regex sub-captures are enough; only the think-block scanner is
//! an explicit depth-aware walk.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{ToolCall, ToolCallFunction};
use crate::toolcall::drain::{find_last_trigger_outside_think, remove_think_blocks};
use crate::toolcall::{fresh_call_id, merge_tool_calls, normalize_tool_arguments};

static FUNCTION_CALLS_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<function_calls>(.*?)</function_calls>").unwrap());
static FUNCTION_CALL_CHUNK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<function_call>(.*?)</function_call>").unwrap());
static FUNCTION_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<name>(.*?)</name>").unwrap());
static FUNCTION_ARGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<args_json>(.*?)</args_json>").unwrap());
static GLM_TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"tool_call_name="([^"]+)""#).unwrap());

/// Parse the XML tool-call region out of a cumulative answer.
///
/// Returns the extracted calls and the byte offset of the trigger in the
/// original text, or `(vec![], None)` when no complete region exists.
/// Think blocks are stripped before parsing so reasoning that quotes the
/// grammar cannot produce phantom calls.
pub fn parse_function_calls_xml(text: &str, trigger_signal: &str) -> (Vec<ToolCall>, Option<usize>) {
    if text.is_empty() || trigger_signal.is_empty() || !text.contains(trigger_signal) {
        return (Vec::new(), None);
    }

    let cleaned = remove_think_blocks(text);
    let Some(pos_in_cleaned) = cleaned.rfind(trigger_signal) else {
        return (Vec::new(), None);
    };

    let Some(block) = FUNCTION_CALLS_BLOCK_RE.captures(&cleaned[pos_in_cleaned..]) else {
        return (Vec::new(), None);
    };

    let mut calls = Vec::new();
    for chunk in FUNCTION_CALL_CHUNK_RE.captures_iter(&block[1]) {
        let body = &chunk[1];
        let Some(name_match) = FUNCTION_NAME_RE.captures(body) else {
            continue;
        };
        let name = name_match[1].trim();
        if name.is_empty() {
            continue;
        }

        let args_raw = FUNCTION_ARGS_RE
            .captures(body)
            .map(|m| m[1].trim().to_string())
            .unwrap_or_else(|| "{}".to_string());

        calls.push(ToolCall {
            id: fresh_call_id(),
            kind: "function".to_string(),
            function: ToolCallFunction {
                name: name.to_string(),
                arguments: normalize_tool_arguments(&args_raw),
            },
        });
    }

    if calls.is_empty() {
        return (Vec::new(), None);
    }

    // Report the trigger position in the original (unstripped) text so
    // callers can slice the answer they actually hold.
    let pos = find_last_trigger_outside_think(text, trigger_signal);
    (calls, pos)
}

/// Run every payload recognizer over a raw frame body and merge the
/// results under the tool-call identity rule.
pub fn extract_tool_calls_from_payload(payload: &str) -> Vec<ToolCall> {
    if payload.is_empty() {
        return Vec::new();
    }

    let mut calls = Vec::new();
    calls = merge_tool_calls(calls, parse_json_tool_calls(payload));
    calls = merge_tool_calls(calls, parse_json_function_call(payload));
    calls = merge_tool_calls(calls, parse_glm_block_tool_calls(payload));
    calls
}

/// Cheap predicate deciding whether a streamed frame body is tool-call
/// plumbing rather than answer text.
pub fn is_tool_call_payload(content: &str) -> bool {
    if content.is_empty() {
        return false;
    }
    content.contains("tool_call_name=\"")
        || content.contains("\"tool_calls\":")
        || content.contains("\"function_call\":")
        || (content.trim_start().starts_with('{') && content.contains("\"mcp_server\""))
        || content.contains("\"type\":\"mcp\"")
}

fn parse_json_tool_calls(payload: &str) -> Vec<ToolCall> {
    let array_json = extract_json_array_by_key(payload, "\"tool_calls\":");
    if array_json.is_empty() {
        return Vec::new();
    }

    let Ok(raw_calls) = serde_json::from_str::<Vec<serde_json::Value>>(array_json) else {
        return Vec::new();
    };

    raw_calls
        .iter()
        .filter_map(parse_single_tool_call_value)
        .collect()
}

fn parse_json_function_call(payload: &str) -> Vec<ToolCall> {
    let obj_json = extract_json_object_by_key(payload, "\"function_call\":");
    if obj_json.is_empty() {
        return Vec::new();
    }

    let Ok(raw) = serde_json::from_str::<serde_json::Value>(obj_json) else {
        return Vec::new();
    };

    let name = raw
        .get("name")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if name.is_empty() {
        return Vec::new();
    }

    vec![ToolCall {
        id: String::new(),
        kind: "function".to_string(),
        function: ToolCallFunction {
            name: name.to_string(),
            arguments: arguments_from_value(raw.get("arguments")),
        },
    }]
}

fn parse_glm_block_tool_calls(payload: &str) -> Vec<ToolCall> {
    GLM_TOOL_NAME_RE
        .captures_iter(payload)
        .filter_map(|m| {
            let name = m[1].trim();
            if name.is_empty() {
                return None;
            }
            Some(ToolCall {
                id: String::new(),
                kind: "function".to_string(),
                function: ToolCallFunction {
                    name: name.to_string(),
                    arguments: "{}".to_string(),
                },
            })
        })
        .collect()
}

/// One entry of a `tool_calls` array: either the OpenAI nested shape
/// `{id, type, function: {name, arguments}}` or a flat `{name, arguments}`.
fn parse_single_tool_call_value(raw: &serde_json::Value) -> Option<ToolCall> {
    let mut call = ToolCall {
        id: raw
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
            .to_string(),
        kind: raw
            .get("type")
            .and_then(serde_json::Value::as_str)
            .filter(|kind| !kind.is_empty())
            .unwrap_or("function")
            .to_string(),
        function: ToolCallFunction::default(),
    };

    if let Some(function) = raw.get("function") {
        if let Some(name) = function.get("name").and_then(serde_json::Value::as_str) {
            call.function.name = name.trim().to_string();
        }
        if let Some(arguments) = function.get("arguments") {
            call.function.arguments = arguments_from_value(Some(arguments));
        }
    }

    if call.function.name.is_empty() {
        if let Some(name) = raw.get("name").and_then(serde_json::Value::as_str) {
            call.function.name = name.trim().to_string();
        }
    }

    if call.function.name.is_empty() {
        return None;
    }
    if call.function.arguments.is_empty() {
        call.function.arguments = "{}".to_string();
    }

    Some(call)
}

/// Arguments may arrive as a JSON string or as an inline value; both are
/// canonicalized to an object string.
fn arguments_from_value(value: Option<&serde_json::Value>) -> String {
    match value {
        None => "{}".to_string(),
        Some(serde_json::Value::String(s)) => normalize_tool_arguments(s),
        Some(other) => {
            let encoded = serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string());
            normalize_tool_arguments(&encoded)
        }
    }
}

// ══════════════════════════════════════════════════════════════════════════════
// KEY-ANCHORED JSON COMPOSITE SCANNING
// ══════════════════════════════════════════════════════════════════════════════

/// Locate the balanced `[…]` following the first occurrence of `key` in
/// raw text. Upstream payloads embed JSON inside larger textual frames,
/// so surrounding noise is tolerated. Empty on any imbalance.
pub fn extract_json_array_by_key<'a>(content: &'a str, key: &str) -> &'a str {
    extract_composite_by_key(content, key, b'[', b']')
}

/// As [`extract_json_array_by_key`], for a balanced `{…}` object.
pub fn extract_json_object_by_key<'a>(content: &'a str, key: &str) -> &'a str {
    extract_composite_by_key(content, key, b'{', b'}')
}

fn extract_composite_by_key<'a>(content: &'a str, key: &str, left: u8, right: u8) -> &'a str {
    let Some(idx) = content.find(key) else {
        return "";
    };

    let bytes = content.as_bytes();
    let mut start = idx + key.len();
    while start < bytes.len() && bytes[start] != left {
        start += 1;
    }
    if start >= bytes.len() {
        return "";
    }

    match find_json_composite_end(bytes, start, left, right) {
        Some(end) => &content[start..end],
        None => "",
    }
}

/// Scan forward from `start` (an opening delimiter) tracking depth with
/// JSON string lexing: quotes toggle in-string state, backslash escapes
/// the next character, and structural bytes inside strings are ignored.
/// Returns the index one past the matching closer.
fn find_json_composite_end(bytes: &[u8], start: usize, left: u8, right: u8) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &ch) in bytes.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            b'\\' => escape_next = true,
            b'"' => in_string = !in_string,
            _ if in_string => {}
            _ if ch == left => depth += 1,
            _ if ch == right => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }

    None
}
