//! End-to-end tool-protocol translation tests.
//!
//! Exercises the full pipeline the gateway composes per request: rewrite
//! an OpenAI-style history into the upstream XML dialect, feed a model
//! reply back through the safe-delta engine chunk by chunk, then recover
//! structured tool calls from the finished buffers. The invariants here
//! are the ones clients actually depend on: streamed deltas concatenate
//! to a prefix of the answer, the trigger sentinel never leaks, and every
//! cut lands on a UTF-8 boundary.

use zai_proxy::models::{
    FunctionDefinition, Message, MessageContent, ToolCall, ToolCallFunction, ToolChoice,
    ToolDefinition,
};
use zai_proxy::toolcall::drain::{drain_safe_answer_delta, drain_safe_answer_tail};
use zai_proxy::toolcall::extract::{extract_tool_calls_from_payload, parse_function_calls_xml};
use zai_proxy::toolcall::rewrite::preprocess_messages_for_tools;
use zai_proxy::toolcall::{merge_tool_calls, normalize_tool_arguments};

const TRIGGER: &str = "<Function_Test_Start/>";

fn search_tool() -> ToolDefinition {
    ToolDefinition {
        kind: "function".to_string(),
        function: FunctionDefinition {
            name: "search".to_string(),
            description: "web search".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "q": { "type": "string" } },
                "required": ["q"]
            }),
        },
    }
}

fn assistant_call_turn(id: &str, name: &str, args: &str) -> Message {
    Message {
        role: "assistant".to_string(),
        content: None,
        name: None,
        tool_call_id: None,
        tool_calls: Some(vec![ToolCall {
            id: id.to_string(),
            kind: "function".to_string(),
            function: ToolCallFunction {
                name: name.to_string(),
                arguments: args.to_string(),
            },
        }]),
    }
}

fn tool_result_turn(id: &str, content: &str) -> Message {
    Message {
        role: "tool".to_string(),
        content: Some(MessageContent::Text(content.to_string())),
        name: None,
        tool_call_id: Some(id.to_string()),
        tool_calls: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rewrite → extract round trip
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn conversation_round_trip_preserves_tool_identity() {
    let history = vec![
        Message::user("what's new in rust?"),
        assistant_call_turn("call_1", "search", r#"{"q":"rust news"}"#),
        tool_result_turn("call_1", "Rust 1.80 released"),
    ];

    let rewritten = preprocess_messages_for_tools(
        &history,
        &[search_tool()],
        Some(&ToolChoice::Mode("required".to_string())),
        TRIGGER,
    );

    // system prompt + user + flattened assistant + synthetic user result
    assert_eq!(rewritten.len(), 4);
    assert_eq!(rewritten[0].role, "system");
    let system = rewritten[0].text();
    assert!(system.contains("You have access to tools."));
    assert!(system.contains(TRIGGER));
    assert!(system.contains("\"required\":[\"q\"]"));
    assert!(system.contains("MUST call at least one tool"));

    let assistant = rewritten[2].text();
    assert!(assistant.contains("<name>search</name>"));
    assert!(assistant.contains(r#"<args_json>{"q":"rust news"}</args_json>"#));

    let result = rewritten[3].text();
    assert_eq!(rewritten[3].role, "user");
    assert!(result.contains("<tool_name>search</tool_name>"));
    assert!(result.contains("<tool_output>Rust 1.80 released</tool_output>"));

    // The model answers in the same grammar; extraction restores the
    // structured shape.
    let reply = format!(
        "<think>需要再查一次</think>好的，我再搜索。\n{TRIGGER}\n<function_calls>\n<function_call>\n<name>search</name>\n<args_json>{{\"q\":\"rust 1.80\"}}</args_json>\n</function_call>\n</function_calls>"
    );
    let (calls, pos) = parse_function_calls_xml(&reply, TRIGGER);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function.name, "search");
    assert_eq!(pos, Some(reply.find(TRIGGER).unwrap()));

    let args: serde_json::Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
    assert_eq!(args["q"], "rust 1.80");
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming invariants
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn chunked_drains_concatenate_to_exact_safe_prefix() {
    let reply = format!(
        "中文回答，包含一些 ASCII mixed in。{TRIGGER}<function_calls><function_call><name>t</name></function_call></function_calls>"
    );

    // Feed the reply byte-by-byte through a growing buffer; this is the
    // worst case for both hold-back and UTF-8 clamping.
    let mut emitted = 0usize;
    let mut collected = String::new();
    let mut buffer = String::new();
    let mut pending: &str = &reply;

    while !pending.is_empty() {
        let step = pending
            .char_indices()
            .nth(1)
            .map_or(pending.len(), |(idx, _)| idx);
        buffer.push_str(&pending[..step]);
        pending = &pending[step..];

        let result = drain_safe_answer_delta(&buffer, emitted, true, TRIGGER);
        assert!(result.emitted >= emitted, "cursor must be monotonic");
        assert!(buffer.is_char_boundary(result.emitted));
        collected.push_str(&result.delta);
        emitted = result.emitted;

        assert!(
            !collected.contains(TRIGGER),
            "emitted text must never contain the trigger"
        );
    }

    let (tail, end) = drain_safe_answer_tail(&reply, emitted, TRIGGER);
    collected.push_str(&tail);

    let trigger_pos = reply.find(TRIGGER).unwrap();
    assert_eq!(end, trigger_pos);
    assert_eq!(collected, reply[..trigger_pos]);
}

#[test]
fn trigger_only_inside_think_is_streamed_as_text() {
    let reply = format!("<think>{TRIGGER} quoted in reasoning</think>answer text");
    let result = drain_safe_answer_delta(&reply, 0, true, TRIGGER);
    assert!(!result.has_trigger);

    let (tail, end) = drain_safe_answer_tail(&reply, result.emitted, TRIGGER);
    assert_eq!(end, reply.len());

    let mut full = result.delta;
    full.push_str(&tail);
    assert_eq!(full, reply);

    let (calls, pos) = parse_function_calls_xml(&reply, TRIGGER);
    assert!(calls.is_empty());
    assert_eq!(pos, None);
}

// ─────────────────────────────────────────────────────────────────────────────
// Dual detection paths merge under one identity
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn xml_and_payload_detections_merge_without_duplicates() {
    let answer = format!(
        "{TRIGGER}<function_calls><function_call><name>weather</name><args_json>{{\"city\":\"beijing\"}}</args_json></function_call></function_calls>"
    );
    let payload = r#"{"data":{"phase":"tool_call"},"tool_calls":[{"id":"call_up1","type":"function","function":{"name":"weather","arguments":"{\"city\":\"beijing\"}"}}]}"#;

    let (xml_calls, _) = parse_function_calls_xml(&answer, TRIGGER);
    let merged = merge_tool_calls(xml_calls, extract_tool_calls_from_payload(payload));

    // Different ids, so both survive; the merged list is normalized.
    assert_eq!(merged.len(), 2);
    for call in &merged {
        assert_eq!(call.kind, "function");
        assert!(!call.id.is_empty());
        assert_eq!(
            call.function.arguments,
            normalize_tool_arguments(&call.function.arguments),
            "merged arguments must be canonical"
        );
    }

    // Re-merging the upstream payload is a no-op: same id, same identity.
    let again = merge_tool_calls(merged.clone(), extract_tool_calls_from_payload(payload));
    assert_eq!(again.len(), merged.len());
}
