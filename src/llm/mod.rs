mod mock;
mod retry;

pub use mock::MockLlmClient;
pub use retry::RetryingLlmClient;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// One message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role:         String,
    pub content:      String,
    /// Set on `tool` role messages to correlate with the originating call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into(), tool_call_id: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into(), tool_call_id: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into(), tool_call_id: None }
    }

    pub fn tool(content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        Self { role: "tool".into(), content: content.into(), tool_call_id }
    }
}

/// A function definition attached to an LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSchema {
    pub name:        String,
    pub description: String,
    /// JSON Schema object describing the arguments.
    pub parameters:  Value,
}

/// A structured tool invocation emitted by the model.
///
/// `arguments` is the raw JSON string as produced by the provider; use
/// [`LlmToolCall::parsed_arguments`] for a lenient decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmToolCall {
    pub id:        String,
    pub name:      String,
    pub arguments: String,
}

impl LlmToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self { id: id.into(), name: name.into(), arguments: arguments.into() }
    }

    /// Decode the arguments, falling back to an empty object on malformed
    /// JSON — models occasionally truncate.
    pub fn parsed_arguments(&self) -> Value {
        serde_json::from_str(&self.arguments).unwrap_or_else(|_| Value::Object(Default::default()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct LlmOptions {
    pub model:       Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens:  Option<u32>,
    pub tools:       Vec<FunctionSchema>,
    pub tool_choice: ToolChoice,
}

/// Complete reply from one generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReply {
    pub content:     String,
    #[serde(default)]
    pub tool_calls:  Vec<LlmToolCall>,
    pub tokens_used: Option<u32>,
    pub provider:    String,
    pub model:       String,
}

impl LlmReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content:     content.into(),
            tool_calls:  Vec::new(),
            tokens_used: None,
            provider:    "unknown".into(),
            model:       String::new(),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<LlmToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_tokens_used(mut self, tokens: u32) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// Typed chunk of a streaming reply. Tokens arrive in model order;
/// tool-call chunks arrive after every token that precedes them in the
/// model's output.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    Token(String),
    ToolCalls(Vec<LlmToolCall>),
    Done { tokens_used: Option<u32> },
}

/// Provider failure. `retryable` distinguishes transient transport issues
/// from fatal ones (auth, malformed request).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LlmError {
    pub message:   String,
    pub retryable: bool,
}

impl LlmError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: true }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self { message: message.into(), retryable: false }
    }
}

impl From<LlmError> for CoreError {
    fn from(err: LlmError) -> Self {
        CoreError::Llm { message: err.message, retryable: err.retryable }
    }
}

/// The single interface between the execution core and any LLM provider.
///
/// # Contract
/// - Must be `Send + Sync` (used behind `Arc<dyn LlmClient>`)
/// - `generate_text` returns the complete reply including any `tool_calls`
/// - `stream_text` yields tokens in order, then tool calls, then `Done`
/// - Errors are returned only for unrecoverable provider interactions;
///   `retryable` marks whether a retry may help
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_text(
        &self,
        messages: &[ChatMessage],
        opts: &LlmOptions,
    ) -> Result<LlmReply, LlmError>;

    fn stream_text<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        opts: &'a LlmOptions,
    ) -> BoxStream<'a, Result<StreamChunk, LlmError>>;

    async fn close(&self) -> Result<(), LlmError> {
        Ok(())
    }

    fn provider(&self) -> &str;
}
