use serde_json::{json, Value};

use conductor_core::completion::{Completion, CompletionRequest, FinishReason, ToolChoice};
use conductor_core::errors::GatewayError;
use conductor_core::ids::ToolCallId;
use conductor_core::messages::{ChatMessage, ToolCall};
use conductor_core::tools::ToolDefinition;

/// Convert a completion request into a chat-completions request body.
pub fn build_request_body(request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": request.selection.model,
        "messages": request.messages.iter().map(convert_message).collect::<Vec<_>>(),
    });

    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools.iter().map(convert_tool).collect::<Vec<_>>());
        body["tool_choice"] = match &request.tool_choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Function(name) => json!({"type": "function", "function": {"name": name}}),
        };
    }

    body
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters_schema,
        }
    })
}

fn convert_message(message: &ChatMessage) -> Value {
    match message {
        ChatMessage::System { content } => json!({"role": "system", "content": content}),
        ChatMessage::User { content } => json!({"role": "user", "content": content}),
        ChatMessage::Assistant { content, tool_calls } => {
            let mut msg = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                msg["tool_calls"] = json!(tool_calls
                    .iter()
                    .map(|tc| json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": encode_arguments(&tc.arguments),
                        }
                    }))
                    .collect::<Vec<_>>());
            }
            msg
        }
        ChatMessage::Tool {
            tool_call_id,
            name,
            content,
        } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id,
            "name": name,
            "content": content,
        }),
    }
}

/// Arguments travel as a JSON-encoded string on the wire.
fn encode_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn decode_arguments(raw: Option<&Value>) -> Value {
    match raw {
        Some(Value::String(s)) if s.trim().is_empty() => json!({}),
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        Some(Value::Null) | None => json!({}),
        Some(other) => other.clone(),
    }
}

/// Parse the first choice of a chat-completions response.
pub fn parse_response(body: &Value) -> Result<Completion, GatewayError> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| GatewayError::MalformedResponse("response has no choices".into()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| GatewayError::MalformedResponse("choice has no message".into()))?;

    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|c| c.as_array()) {
        for call in calls {
            let function = call
                .get("function")
                .ok_or_else(|| GatewayError::MalformedResponse("tool call without function".into()))?;
            let name = function
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or_else(|| GatewayError::MalformedResponse("tool call without name".into()))?;
            let id = call
                .get("id")
                .and_then(|i| i.as_str())
                .map(ToolCallId::from_raw)
                .unwrap_or_default();
            tool_calls.push(ToolCall {
                id,
                name: name.to_string(),
                arguments: decode_arguments(function.get("arguments")),
            });
        }
    }

    // Some local backends report "stop" even when they emitted tool calls.
    let finish_reason = match choice.get("finish_reason").and_then(|f| f.as_str()) {
        _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    };

    Ok(Completion {
        content,
        tool_calls,
        finish_reason,
    })
}
