use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

use super::core::AgentCore;
use super::events::AgentEvent;
use crate::cancel::CancelToken;
use crate::config::{LlmConfig, ResourceLimitsConfig};
use crate::error::{CoreError, CoreResult};
use crate::llm::{ChatMessage, LlmClient, LlmOptions, StreamChunk};

/// Conversation-holding agent over a single [`LlmClient`].
///
/// Keeps the message list, enforces the configured model options, accounts
/// tokens into the sliding window, and honors cancellation at token
/// boundaries — tokens delivered before the cancel are kept.
pub struct LlmAgent {
    core:     Arc<AgentCore>,
    llm:      Arc<dyn LlmClient>,
    config:   LlmConfig,
    messages: Mutex<Vec<ChatMessage>>,
}

impl LlmAgent {
    pub fn new(
        agent_id: impl Into<String>,
        llm: Arc<dyn LlmClient>,
        config: LlmConfig,
    ) -> CoreResult<Self> {
        let core = Arc::new(AgentCore::new(agent_id, ResourceLimitsConfig::default()));
        core.initialize()?;
        Ok(Self {
            core,
            llm,
            config,
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn with_system_prompt(self, prompt: impl Into<String>) -> Self {
        self.messages
            .lock()
            .expect("message lock poisoned")
            .push(ChatMessage::system(prompt));
        self
    }

    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    pub fn history(&self) -> Vec<ChatMessage> {
        self.messages.lock().expect("message lock poisoned").clone()
    }

    /// Drop everything except system messages.
    pub fn reset_conversation(&self) {
        self.messages
            .lock()
            .expect("message lock poisoned")
            .retain(|m| m.role == "system");
    }

    fn options(&self) -> LlmOptions {
        LlmOptions {
            model:       Some(self.config.model.clone()).filter(|m| !m.is_empty()),
            temperature: Some(self.config.temperature),
            max_tokens:  Some(self.config.max_tokens),
            tools:       Vec::new(),
            tool_choice: Default::default(),
        }
    }

    fn account_tokens(&self, tokens_used: Option<u32>, content: &str) {
        // Providers that omit usage get a chars/4 estimate.
        let amount = tokens_used
            .map(u64::from)
            .unwrap_or_else(|| (content.len() / 4) as u64);
        self.core.resources().record_tokens(amount);
    }

    /// One full request/response turn.
    pub async fn send(&self, content: impl Into<String>) -> CoreResult<String> {
        let content = content.into();
        let messages = {
            let mut messages = self.messages.lock().expect("message lock poisoned");
            messages.push(ChatMessage::user(content));
            messages.clone()
        };

        let reply = self
            .llm
            .generate_text(&messages, &self.options())
            .await
            .map_err(CoreError::from)?;
        self.account_tokens(reply.tokens_used, &reply.content);

        self.messages
            .lock()
            .expect("message lock poisoned")
            .push(ChatMessage::assistant(&reply.content));
        Ok(reply.content)
    }

    /// Streaming turn. Emits one [`AgentEvent::Token`] per chunk and returns
    /// the accumulated content. On cancellation the tokens already received
    /// are delivered and kept in history; no further tokens arrive and no
    /// error is raised.
    pub async fn send_streaming(
        &self,
        content: impl Into<String>,
        events: UnboundedSender<AgentEvent>,
        cancel: CancelToken,
    ) -> CoreResult<String> {
        let content = content.into();
        let messages = {
            let mut messages = self.messages.lock().expect("message lock poisoned");
            messages.push(ChatMessage::user(content));
            messages.clone()
        };

        let opts = self.options();
        let mut stream = self.llm.stream_text(&messages, &opts);
        let mut accumulated = String::new();
        let mut usage = None;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                tracing::debug!(agent = %self.core.agent_id(), "stream cancelled at token boundary");
                break;
            }
            match chunk {
                Ok(StreamChunk::Token(token)) => {
                    accumulated.push_str(&token);
                    let _ = events.send(AgentEvent::token(token));
                }
                Ok(StreamChunk::ToolCalls(_)) => {
                    // A bare conversation agent attaches no tools; ignore.
                }
                Ok(StreamChunk::Done { tokens_used }) => {
                    usage = tokens_used;
                }
                Err(err) => {
                    drop(stream);
                    self.account_tokens(usage, &accumulated);
                    return Err(CoreError::from(err));
                }
            }
        }
        drop(stream);

        self.account_tokens(usage, &accumulated);
        self.messages
            .lock()
            .expect("message lock poisoned")
            .push(ChatMessage::assistant(&accumulated));
        Ok(accumulated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmReply, MockLlmClient};

    fn agent(replies: Vec<LlmReply>) -> LlmAgent {
        LlmAgent::new(
            "llm-agent",
            Arc::new(MockLlmClient::new(replies)),
            LlmConfig::default(),
        )
        .unwrap()
        .with_system_prompt("You are terse.")
    }

    #[tokio::test]
    async fn send_appends_history() {
        let agent = agent(vec![LlmReply::text("four").with_tokens_used(12)]);
        let reply = agent.send("what is 2+2").await.unwrap();
        assert_eq!(reply, "four");

        let history = agent.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].role, "system");
        assert_eq!(history[2].role, "assistant");
        assert_eq!(agent.core().resources().usage().tokens_last_minute, 12);
    }

    #[tokio::test]
    async fn reset_keeps_system_messages() {
        let agent = agent(vec![LlmReply::text("hi")]);
        agent.send("hello").await.unwrap();
        agent.reset_conversation();
        let history = agent.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, "system");
    }

    #[tokio::test]
    async fn streaming_delivers_all_tokens() {
        let agent = agent(vec![LlmReply::text("alpha beta gamma")]);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let content = agent
            .send_streaming("go", tx, CancelToken::new())
            .await
            .unwrap();
        assert_eq!(content, "alpha beta gamma");

        let mut streamed = String::new();
        while let Ok(event) = rx.try_recv() {
            if let AgentEvent::Token { token } = event {
                streamed.push_str(&token);
            }
        }
        assert_eq!(streamed, content);
    }

    #[tokio::test]
    async fn cancelled_stream_keeps_partial_tokens_without_error() {
        let agent = agent(vec![LlmReply::text("one two three four")]);
        let cancel = CancelToken::new();
        // Cancelled before the stream starts: zero tokens, no error.
        cancel.cancel();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let content = agent.send_streaming("go", tx, cancel).await.unwrap();
        assert_eq!(content, "");
        assert!(rx.try_recv().is_err(), "no tokens after cancellation");
    }

    #[tokio::test]
    async fn missing_usage_falls_back_to_estimate() {
        let agent = agent(vec![LlmReply::text("12345678")]);
        agent.send("x").await.unwrap();
        assert_eq!(agent.core().resources().usage().tokens_last_minute, 2);
    }
}
