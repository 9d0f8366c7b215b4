use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use super::{ChatMessage, LlmClient, LlmError, LlmOptions, LlmReply, StreamChunk};
use async_trait::async_trait;

/// A wrapper around any [`LlmClient`] that retries transient failures with
/// exponential back-off.
///
/// Auth failures are never retried; rate limits get a longer initial wait.
pub struct RetryingLlmClient {
    inner:       Arc<dyn LlmClient>,
    max_retries: u32,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, max_retries: u32) -> Self {
        Self { inner, max_retries }
    }

    fn is_auth_error(err: &LlmError) -> bool {
        let lower = err.message.to_lowercase();
        lower.contains("401")
            || lower.contains("403")
            || lower.contains("authentication")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("invalid api key")
    }

    fn is_rate_limit_error(err: &LlmError) -> bool {
        let lower = err.message.to_lowercase();
        lower.contains("429")
            || lower.contains("rate limit")
            || lower.contains("too many requests")
            || lower.contains("quota")
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn generate_text(
        &self,
        messages: &[ChatMessage],
        opts: &LlmOptions,
    ) -> Result<LlmReply, LlmError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            match self.inner.generate_text(messages, opts).await {
                Ok(reply) => return Ok(reply),
                Err(e) if Self::is_auth_error(&e) => {
                    tracing::error!(error = %e, "LLM auth error, not retrying");
                    return Err(LlmError::fatal(e.message));
                }
                Err(e) if !e.retryable && !Self::is_rate_limit_error(&e) => {
                    return Err(e);
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let base_wait = if Self::is_rate_limit_error(&e) { 5 } else { 1 };
                        let wait_secs = std::cmp::min(base_wait << attempt, 60);
                        tracing::warn!(
                            attempt = attempt + 1,
                            max     = self.max_retries,
                            wait_s  = wait_secs,
                            error   = %e,
                            "LLM transient error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                    }
                    last_err = Some(e);
                }
            }
        }

        let last = last_err.map(|e| e.message).unwrap_or_default();
        Err(LlmError::transient(format!(
            "LLM failed after {} retries, last error: {}",
            self.max_retries, last
        )))
    }

    fn stream_text<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        opts: &'a LlmOptions,
    ) -> BoxStream<'a, Result<StreamChunk, LlmError>> {
        // A mid-stream failure cannot be replayed without duplicating
        // already-delivered tokens, so streams delegate without retry.
        self.inner.stream_text(messages, opts)
    }

    async fn close(&self) -> Result<(), LlmError> {
        self.inner.close().await
    }

    fn provider(&self) -> &str {
        self.inner.provider()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyClient {
        failures_before_success: usize,
        calls: AtomicUsize,
        error: LlmError,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn generate_text(
            &self,
            _messages: &[ChatMessage],
            _opts: &LlmOptions,
        ) -> Result<LlmReply, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(self.error.clone())
            } else {
                Ok(LlmReply::text("ok"))
            }
        }

        fn stream_text<'a>(
            &'a self,
            _messages: &'a [ChatMessage],
            _opts: &'a LlmOptions,
        ) -> BoxStream<'a, Result<StreamChunk, LlmError>> {
            futures::stream::empty().boxed()
        }

        fn provider(&self) -> &str {
            "flaky"
        }
    }

    use futures::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let client = RetryingLlmClient::new(
            Arc::new(FlakyClient {
                failures_before_success: 2,
                calls: AtomicUsize::new(0),
                error: LlmError::transient("503 service unavailable"),
            }),
            3,
        );
        let reply = client
            .generate_text(&[ChatMessage::user("hi")], &LlmOptions::default())
            .await
            .unwrap();
        assert_eq!(reply.content, "ok");
    }

    #[tokio::test]
    async fn auth_errors_fail_immediately() {
        let client = RetryingLlmClient::new(
            Arc::new(FlakyClient {
                failures_before_success: 10,
                calls: AtomicUsize::new(0),
                error: LlmError::transient("401 unauthorized"),
            }),
            3,
        );
        let err = client
            .generate_text(&[ChatMessage::user("hi")], &LlmOptions::default())
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("401"));
    }
}
