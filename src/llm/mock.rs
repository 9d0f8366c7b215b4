use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Mutex;

use super::{ChatMessage, LlmClient, LlmError, LlmOptions, LlmReply, StreamChunk};
use async_trait::async_trait;

/// Scripted LLM for tests and demos — replies are consumed in order and the
/// call log records what each call saw. No network.
pub struct MockLlmClient {
    replies:  Mutex<Vec<LlmReply>>,
    call_log: Mutex<Vec<MockCall>>,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub model:         Option<String>,
    pub message_count: usize,
    pub tool_count:    usize,
    pub last_user:     Option<String>,
}

impl MockLlmClient {
    pub fn new(replies: Vec<LlmReply>) -> Self {
        Self {
            replies:  Mutex::new(replies),
            call_log: Mutex::new(Vec::new()),
        }
    }

    /// Number of times the model was called (generate or stream).
    pub fn call_count(&self) -> usize {
        self.call_log.lock().expect("mock lock poisoned").len()
    }

    pub fn call(&self, n: usize) -> Option<MockCall> {
        self.call_log.lock().expect("mock lock poisoned").get(n).cloned()
    }

    fn next_reply(&self, messages: &[ChatMessage], opts: &LlmOptions) -> Result<LlmReply, LlmError> {
        self.call_log.lock().expect("mock lock poisoned").push(MockCall {
            model:         opts.model.clone(),
            message_count: messages.len(),
            tool_count:    opts.tools.len(),
            last_user:     messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone()),
        });

        let mut replies = self.replies.lock().expect("mock lock poisoned");
        if replies.is_empty() {
            return Err(LlmError::fatal("MockLlmClient: no more programmed replies"));
        }
        Ok(replies.remove(0))
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate_text(
        &self,
        messages: &[ChatMessage],
        opts: &LlmOptions,
    ) -> Result<LlmReply, LlmError> {
        self.next_reply(messages, opts)
    }

    fn stream_text<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        opts: &'a LlmOptions,
    ) -> BoxStream<'a, Result<StreamChunk, LlmError>> {
        let chunks: Vec<Result<StreamChunk, LlmError>> = match self.next_reply(messages, opts) {
            Err(err) => vec![Err(err)],
            Ok(reply) => {
                let mut chunks = Vec::new();
                // Tokenize by whitespace, keeping separators, so the caller
                // can reassemble the exact content.
                let mut rest = reply.content.as_str();
                while !rest.is_empty() {
                    let split = rest
                        .char_indices()
                        .find(|(_, c)| c.is_whitespace())
                        .map(|(i, c)| i + c.len_utf8())
                        .unwrap_or(rest.len());
                    chunks.push(Ok(StreamChunk::Token(rest[..split].to_string())));
                    rest = &rest[split..];
                }
                if !reply.tool_calls.is_empty() {
                    chunks.push(Ok(StreamChunk::ToolCalls(reply.tool_calls)));
                }
                chunks.push(Ok(StreamChunk::Done { tokens_used: reply.tokens_used }));
                chunks
            }
        };
        futures::stream::iter(chunks).boxed()
    }

    fn provider(&self) -> &str {
        "mock"
    }
}
