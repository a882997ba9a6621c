//! ExcelManus provider contract.
//!
//! This crate defines the request/response types the agent core uses to
//! talk to any LLM backend, plus the [`LlmProvider`] trait every wire
//! adapter implements. The adapters themselves (OpenAI, Anthropic,
//! Gemini, ...) live outside the core and are not defined here.

use serde::{Deserialize, Serialize};

pub mod chat;
pub mod error;

use chat::{ChatMessage, ResponseFormat, Tool};
use error::LlmError;

/// Tool call represents a function call the LLM wants the engine to run.
/// The structure is standardized across all providers.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct ToolCall {
    /// The ID of the tool call.
    pub id: String,
    /// The type of the tool call (usually "function").
    #[serde(rename = "type")]
    pub call_type: String,
    /// The function to call.
    pub function: FunctionCall,
}

/// FunctionCall carries which function to call and its raw arguments.
#[derive(Debug, Deserialize, Serialize, Clone, Eq, PartialEq)]
pub struct FunctionCall {
    /// The name of the function to call.
    pub name: String,
    /// The arguments, typically serialized as a JSON object string.
    pub arguments: String,
}

/// Token usage reported by the provider, tolerant of multiple formats.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Eq, PartialEq, Default)]
pub struct Usage {
    #[serde(alias = "prompt_tokens", alias = "input_tokens")]
    pub input_tokens: u32,
    #[serde(alias = "completion_tokens", alias = "output_tokens")]
    pub output_tokens: u32,
}

/// One request to a chat provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<Tool>>,
    pub response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: None,
            response_format: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }
}

/// Provider response: assistant text plus any tool calls it emitted.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: None,
            usage: None,
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

/// Core trait every LLM backend implements.
///
/// Adapters are expected to retry transient failures (provider 5xx,
/// connection resets) with exponential backoff internally; an `Err`
/// from `chat` is terminal for the current session turn.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Human-readable provider/model label, used in logs and events.
    fn model_label(&self) -> String {
        "unknown".to_string()
    }
}
