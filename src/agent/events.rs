use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured events emitted by agents during streaming execution.
///
/// Ordering is causal: a `ToolCalls` event precedes the `ToolCall` and
/// `ToolResult` events it announces; `Result` is always last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Progress note, e.g. "selecting tools".
    Status { message: String },
    /// One streamed LLM token.
    Token { token: String },
    /// The model requested a batch of tool calls.
    ToolCalls { count: usize },
    /// One tool call is starting.
    #[serde(rename = "tool_call")]
    ToolCall { name: String, arguments: Value },
    /// One tool call finished.
    ToolResult {
        name:    String,
        success: bool,
        result:  Value,
    },
    /// Final outcome of the turn.
    Result { success: bool, payload: Value },
    Error { message: String },
}

impl AgentEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status { message: message.into() }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self::Token { token: token.into() }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Token { .. } => "token",
            Self::ToolCalls { .. } => "tool_calls",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }
}
