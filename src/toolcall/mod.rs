//! Tool-call protocol translation.
//!
//! The upstream model has no native `tool_calls` channel, so the proxy
//! teaches it an XML grammar in-band: a trigger sentinel followed by a
//! `<function_calls>` block. This module tree owns every side of that
//! contract — rewriting inbound conversations into the grammar
//! ([`rewrite`]), recovering structured calls from model output
//! ([`extract`]), and deciding what part of a growing answer is safe to
//! stream to the client before the sentinel may appear ([`drain`]).

pub mod drain;
pub mod extract;
pub mod rewrite;

use crate::models::ToolCall;

/// Sentinel separating the natural-language answer from the tool-call XML
/// region. Every operation takes the sentinel as a parameter; this is the
/// process-wide default.
pub const DEFAULT_TRIGGER_SIGNAL: &str = "<Function_Go_Start/>";

/// Mint an OpenAI-style call id: `call_` plus 24 hex chars.
pub(crate) fn fresh_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..24])
}

/// Canonicalize an arguments payload into the textual form of a JSON
/// object. Empty input becomes `{}`; a non-object JSON value is wrapped
/// as `{"value": …}`; unparseable text is wrapped as `{"raw": …}`.
/// Idempotent.
pub fn normalize_tool_arguments(arguments: &str) -> String {
    if arguments.trim().is_empty() {
        return "{}".to_string();
    }
    normalize_json_arguments(arguments)
}

fn normalize_json_arguments(raw: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => {
            serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string())
        }
        Ok(value) => serde_json::json!({ "value": value }).to_string(),
        Err(_) => serde_json::json!({ "raw": raw }).to_string(),
    }
}

/// Fill defaults on a call from any detection path: `function` type, a
/// fresh id when missing, trimmed name, canonical arguments.
pub fn normalize_tool_call(mut call: ToolCall) -> ToolCall {
    if call.kind.trim().is_empty() {
        call.kind = "function".to_string();
    }
    if call.id.trim().is_empty() {
        call.id = fresh_call_id();
    }
    call.function.name = call.function.name.trim().to_string();
    call.function.arguments = normalize_tool_arguments(&call.function.arguments);
    call
}

/// Identity under which calls are deduplicated: the id when present,
/// otherwise the (name, canonical arguments) pair.
fn tool_call_unique_key(call: &ToolCall) -> String {
    let id = call.id.trim();
    if !id.is_empty() {
        return format!("id:{id}");
    }
    format!(
        "payload:{}|{}",
        call.function.name,
        normalize_tool_arguments(&call.function.arguments)
    )
}

/// Append each normalized incoming call whose identity is not already
/// present in `existing`.
pub fn merge_tool_calls(mut existing: Vec<ToolCall>, incoming: Vec<ToolCall>) -> Vec<ToolCall> {
    if incoming.is_empty() {
        return existing;
    }

    let mut seen: std::collections::HashSet<String> =
        existing.iter().map(tool_call_unique_key).collect();

    for call in incoming {
        // Key before normalization: id synthesis would otherwise make
        // every id-less call unique and defeat structural identity.
        let key = tool_call_unique_key(&call);
        if seen.insert(key) {
            existing.push(normalize_tool_call(call));
        }
    }

    existing
}
