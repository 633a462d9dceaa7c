//! Inbound conversation rewriting.
//!
//! OpenAI-style histories carry assistant `tool_calls` turns and `tool`
//! result turns that the upstream has no channel for. Both are folded back
//! into the in-band XML grammar before the conversation is forwarded: tool
//! results become synthetic user messages, assistant tool-call turns
//! become plain text ending in the trigger sentinel, and a system prompt
//! teaching the grammar is prepended whenever tools are declared.

use std::collections::HashMap;

use crate::models::{Message, MessageContent, ToolChoice, ToolDefinition};
use crate::toolcall::normalize_tool_arguments;

/// Rewrite an inbound message list for the upstream dialect. `tools` and
/// `tool_choice` come straight from the client request; `trigger_signal`
/// is the sentinel the model is told to emit.
pub fn preprocess_messages_for_tools(
    messages: &[Message],
    tools: &[ToolDefinition],
    tool_choice: Option<&ToolChoice>,
    trigger_signal: &str,
) -> Vec<Message> {
    let tool_index = build_tool_call_index(messages);
    let mut preprocessed = Vec::with_capacity(messages.len() + 1);

    for msg in messages {
        let role = msg.role.trim().to_lowercase();
        match role.as_str() {
            "tool" => {
                let content_text = msg.text();
                let call_id = msg.tool_call_id.as_deref().unwrap_or("");
                let (name, arguments) = match tool_index.get(call_id) {
                    Some((name, arguments)) => (name.clone(), arguments.clone()),
                    None => {
                        let fallback = msg
                            .name
                            .as_deref()
                            .map(str::trim)
                            .filter(|name| !name.is_empty())
                            .unwrap_or("unknown_tool");
                        (fallback.to_string(), "{}".to_string())
                    }
                };
                preprocessed.push(Message::user(format_tool_result_for_upstream(
                    &name,
                    &arguments,
                    &content_text,
                )));
            }
            "assistant" => {
                let calls = msg.tool_calls.as_deref().unwrap_or_default();
                if calls.is_empty() {
                    preprocessed.push(msg.clone());
                    continue;
                }
                let xml = format_assistant_tool_calls_for_upstream(calls, trigger_signal);
                let text = msg.text();
                let content = format!("{}\n{xml}", text.trim()).trim().to_string();
                preprocessed.push(Message::assistant(content));
            }
            "developer" => {
                let mut cloned = msg.clone();
                cloned.role = "system".to_string();
                preprocessed.push(cloned);
            }
            _ => preprocessed.push(msg.clone()),
        }
    }

    if !tools.is_empty() {
        let prompt = generate_function_prompt(tools, tool_choice, trigger_signal);
        if !prompt.is_empty() {
            preprocessed.insert(0, Message::system(prompt));
        }
    }

    preprocessed
}

/// Index prior assistant tool-call turns by call id so tool results can
/// name the call they answer.
fn build_tool_call_index(messages: &[Message]) -> HashMap<String, (String, String)> {
    let mut index = HashMap::new();
    for msg in messages {
        if !msg.role.eq_ignore_ascii_case("assistant") {
            continue;
        }
        for call in msg.tool_calls.as_deref().unwrap_or_default() {
            if call.id.is_empty() || call.function.name.is_empty() {
                continue;
            }
            let arguments = normalize_tool_arguments(&call.function.arguments);
            index.insert(call.id.clone(), (call.function.name.clone(), arguments));
        }
    }
    index
}

fn format_tool_result_for_upstream(name: &str, arguments: &str, output: &str) -> String {
    [
        "<tool_execution_result>".to_string(),
        format!("<tool_name>{name}</tool_name>"),
        format!("<tool_arguments>{arguments}</tool_arguments>"),
        format!("<tool_output>{output}</tool_output>"),
        "</tool_execution_result>".to_string(),
    ]
    .join("\n")
}

fn format_assistant_tool_calls_for_upstream(
    calls: &[crate::models::ToolCall],
    trigger_signal: &str,
) -> String {
    let mut blocks = Vec::new();
    for call in calls {
        let name = call.function.name.trim();
        if name.is_empty() {
            continue;
        }
        let arguments = normalize_tool_arguments(&call.function.arguments);
        blocks.push(
            [
                "<function_call>".to_string(),
                format!("<name>{name}</name>"),
                format!("<args_json>{arguments}</args_json>"),
                "</function_call>".to_string(),
            ]
            .join("\n"),
        );
    }
    if blocks.is_empty() {
        return String::new();
    }

    format!(
        "{trigger_signal}\n<function_calls>\n{}\n</function_calls>",
        blocks.join("\n")
    )
}

/// The fixed English prompt teaching the XML grammar, enumerating the
/// declared functions and appending any `tool_choice` constraint.
fn generate_function_prompt(
    tools: &[ToolDefinition],
    tool_choice: Option<&ToolChoice>,
    trigger_signal: &str,
) -> String {
    let mut tool_lines = Vec::new();
    for (i, tool) in tools.iter().enumerate() {
        if tool.kind != "function" || tool.function.name.is_empty() {
            continue;
        }

        let required = tool
            .function
            .parameters
            .get("required")
            .and_then(serde_json::Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(serde_json::Value::as_str)
                    .filter(|name| !name.is_empty())
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .filter(|joined| !joined.is_empty())
            .unwrap_or_else(|| "None".to_string());

        let params_json = serde_json::to_string(&tool.function.parameters)
            .unwrap_or_else(|_| "{}".to_string());

        let desc = tool.function.description.trim();
        let desc = if desc.is_empty() { "None" } else { desc };

        tool_lines.push(format!(
            "{}. <tool name=\"{}\">\n   Description: {}\n   Required: {}\n   Parameters JSON Schema: {}",
            i + 1,
            tool.function.name,
            desc,
            required,
            params_json,
        ));
    }

    let tools_block = if tool_lines.is_empty() {
        "(no tools)".to_string()
    } else {
        tool_lines.join("\n\n")
    };

    let mut prompt = [
        "You have access to tools.",
        "",
        "When you need to call tools, you MUST output exactly:",
        trigger_signal,
        "<function_calls>",
        "  <function_call>",
        "    <name>tool_name</name>",
        "    <args_json>{\"arg\":\"value\"}</args_json>",
        "  </function_call>",
        "</function_calls>",
        "",
        "Rules:",
        "1) args_json MUST be valid JSON object",
        "2) For multiple calls, output one <function_calls> with multiple <function_call> children",
        "3) If no tool is needed, answer normally",
        "",
        &format!("Available tools:\n{tools_block}"),
    ]
    .join("\n");

    prompt.push_str(&tool_choice_constraint(tool_choice));
    prompt
}

fn tool_choice_constraint(tool_choice: Option<&ToolChoice>) -> String {
    match tool_choice {
        Some(ToolChoice::Mode(mode)) => match mode.as_str() {
            "required" => {
                "\nIMPORTANT: You MUST call at least one tool in your next response.".to_string()
            }
            "none" => "\nIMPORTANT: Do not call tools. Answer directly.".to_string(),
            _ => String::new(),
        },
        Some(ToolChoice::Function(selection)) => {
            let name = selection.function.name.trim();
            if name.is_empty() {
                String::new()
            } else {
                format!("\nIMPORTANT: You MUST call this tool: {name}")
            }
        }
        None => String::new(),
    }
}
