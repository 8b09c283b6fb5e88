use serde::{Deserialize, Serialize};

use crate::ids::ToolCallId;

/// One entry of a conversation sent to the completion gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: ToolCallId,
        name: String,
        content: String,
    },
}

/// A function call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    /// Decoded JSON arguments. Undecodable argument strings are kept as a JSON string.
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: ToolCallId::new(),
            name: name.into(),
            arguments,
        }
    }

    /// String argument by key, if present.
    pub fn str_arg(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).and_then(|v| v.as_str())
    }
}

// --- Convenience constructors ---

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::System { content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::User { content: content.into() }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self::Assistant {
            content: None,
            tool_calls,
        }
    }

    pub fn tool_result(
        tool_call_id: ToolCallId,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::Tool {
            tool_call_id,
            name: name.into(),
            content: content.into(),
        }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    /// Plain text carried by the message, empty for pure tool-call turns.
    pub fn text(&self) -> &str {
        match self {
            Self::System { content } | Self::User { content } | Self::Tool { content, .. } => content,
            Self::Assistant { content, .. } => content.as_deref().unwrap_or(""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_tagged_serialization() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn assistant_tool_calls_omit_content() {
        let call = ToolCall::new("write_command", serde_json::json!({"command": "ls"}));
        let json = serde_json::to_value(ChatMessage::assistant_tool_calls(vec![call])).unwrap();
        assert!(json.get("content").is_none());
        assert_eq!(json["tool_calls"][0]["name"], "write_command");
    }

    #[test]
    fn text_accessor() {
        assert_eq!(ChatMessage::assistant_tool_calls(vec![]).text(), "");
        assert_eq!(
            ChatMessage::tool_result(ToolCallId::from_raw("c1"), "ls", "a.txt").text(),
            "a.txt"
        );
        assert_eq!(ChatMessage::system("sys").role(), "system");
    }

    #[test]
    fn str_arg_lookup() {
        let call = ToolCall::new("read_file", serde_json::json!({"filename": "a.rs"}));
        assert_eq!(call.str_arg("filename"), Some("a.rs"));
        assert_eq!(call.str_arg("missing"), None);
    }
}
