//! Chat message and tool-schema types shared by the core and providers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a participant in a chat conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// The type of a message in a chat conversation.
///
/// Content is either plain text or a list of parts; image parts carry a
/// URL (possibly a data URL) plus a detail hint, matching what the
/// vision-capable providers accept.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageType {
    #[default]
    Text,
    /// An image referenced by URL (or data URL).
    ImageUrl {
        url: String,
        detail: Option<String>,
    },
    /// Tool calls emitted by the assistant.
    ToolUse(Vec<crate::ToolCall>),
    /// Result of a previous tool call.
    ToolResult {
        tool_call_id: String,
        tool_name: String,
    },
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub message_type: MessageType,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            message_type: MessageType::Text,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            message_type: MessageType::Text,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            message_type: MessageType::Text,
            content: content.into(),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: ChatRole::User,
            message_type: MessageType::ToolResult {
                tool_call_id: tool_call_id.into(),
                tool_name: tool_name.into(),
            },
            content: content.into(),
        }
    }
}

/// Represents a function definition for a tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionTool {
    /// The name of the function.
    pub name: String,
    /// Description of what the function does.
    pub description: String,
    /// JSON schema for the parameters object.
    pub parameters: Value,
}

/// Represents a tool that can be offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Tool {
    /// The type of tool (e.g. "function").
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The function definition if this is a function tool.
    pub function: FunctionTool,
}

impl Tool {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionTool {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

/// Structured-output request, e.g. `{"type": "json_object"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ResponseFormat {
    JsonObject,
    Text,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ChatRole::User).unwrap(), r#""user""#);
        assert_eq!(
            serde_json::to_string(&ChatRole::Assistant).unwrap(),
            r#""assistant""#
        );
    }

    #[test]
    fn tool_helper_builds_function_tool() {
        let tool = Tool::function(
            "read_cells",
            "Read a cell range",
            json!({"type": "object", "properties": {}}),
        );
        assert_eq!(tool.tool_type, "function");
        assert_eq!(tool.function.name, "read_cells");
    }

    #[test]
    fn response_format_json_object_tag() {
        let json = serde_json::to_string(&ResponseFormat::JsonObject).unwrap();
        assert_eq!(json, r#"{"type":"json_object"}"#);
    }

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::user("u").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);
        let tr = ChatMessage::tool_result("id1", "read_cells", "ok");
        assert!(matches!(tr.message_type, MessageType::ToolResult { .. }));
    }
}
