use std::sync::Arc;
use std::time::Duration;

use super::context::ContextSelector;
use super::hybrid::{FallbackFn, HybridAgent, HybridConfig};
use crate::config::{LlmConfig, RateLimitConfig, ResourceLimitsConfig, ToolCacheConfig};
use crate::context_engine::ContextEngine;
use crate::error::CoreResult;
use crate::llm::{LlmClient, RetryingLlmClient};
use crate::tools::{Tool, ToolExecutor, ToolRegistry};

/// Ergonomic construction of a [`HybridAgent`].
///
/// ```no_run
/// # use std::sync::Arc;
/// # use agentexec::agent::HybridAgentBuilder;
/// # use agentexec::llm::MockLlmClient;
/// # use agentexec::tools::builtin::CalculatorTool;
/// let agent = HybridAgentBuilder::new("researcher")
///     .llm(Arc::new(MockLlmClient::new(vec![])))
///     .retry_on_error(3)
///     .tool(Arc::new(CalculatorTool::new()))
///     .system_prompt("Answer with numbers only.")
///     .capability("research")
///     .build()
///     .expect("agent builds");
/// ```
pub struct HybridAgentBuilder {
    agent_id:       String,
    registry:       Arc<ToolRegistry>,
    executor:       Option<Arc<ToolExecutor>>,
    llm:            Option<Arc<dyn LlmClient>>,
    retry_count:    Option<u32>,
    config:         HybridConfig,
    limits:         ResourceLimitsConfig,
    cache_config:   ToolCacheConfig,
    rate_config:    RateLimitConfig,
    selector:       ContextSelector,
    capabilities:   Vec<String>,
    fallback:       Option<FallbackFn>,
    context_engine: Option<Arc<dyn ContextEngine>>,
}

impl HybridAgentBuilder {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id:       agent_id.into(),
            registry:       Arc::new(ToolRegistry::new()),
            executor:       None,
            llm:            None,
            retry_count:    None,
            config:         HybridConfig::default(),
            limits:         ResourceLimitsConfig::default(),
            cache_config:   ToolCacheConfig::default(),
            rate_config:    RateLimitConfig::default(),
            selector:       ContextSelector::default(),
            capabilities:   Vec::new(),
            fallback:       None,
            context_engine: None,
        }
    }

    /// Set the LLM client. Wrap it with `retry_on_error` for transient
    /// failure handling.
    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Wrap the LLM client with automatic retry on transient errors.
    pub fn retry_on_error(mut self, retries: u32) -> Self {
        self.retry_count = Some(retries);
        self
    }

    /// Register a tool into the agent's registry. Ignored when a prebuilt
    /// executor is supplied via [`HybridAgentBuilder::executor`].
    pub fn tool(self, tool: Arc<dyn Tool>) -> Self {
        self.registry.register(tool);
        self
    }

    /// Share a prebuilt executor (and its registry, cache and rate limiter)
    /// instead of building one from registered tools.
    pub fn executor(mut self, executor: Arc<ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn max_iterations(mut self, n: u32) -> Self {
        self.config.max_iterations = n;
        self
    }

    pub fn max_parallel_tools(mut self, n: usize) -> Self {
        self.config.max_parallel_tools = n;
        self
    }

    pub fn llm_config(mut self, config: LlmConfig) -> Self {
        self.config.llm = config;
        self
    }

    pub fn learning(mut self, enabled: bool) -> Self {
        self.config.learning_enabled = enabled;
        self
    }

    pub fn resource_wait(mut self, wait: Duration) -> Self {
        self.config.resource_wait = wait;
        self
    }

    pub fn limits(mut self, limits: ResourceLimitsConfig) -> Self {
        self.limits = limits;
        self
    }

    pub fn cache_config(mut self, config: ToolCacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    pub fn rate_config(mut self, config: RateLimitConfig) -> Self {
        self.rate_config = config;
        self
    }

    pub fn min_relevance_score(mut self, score: f64) -> Self {
        self.selector.min_relevance_score = score;
        self
    }

    pub fn max_context_tokens(mut self, tokens: usize) -> Self {
        self.selector.max_tokens = tokens;
        self
    }

    pub fn preserve_context_type(mut self, item_type: impl Into<String>) -> Self {
        self.selector.preserve_types.insert(item_type.into());
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn fallback(mut self, fallback: FallbackFn) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn context_engine(mut self, engine: Arc<dyn ContextEngine>) -> Self {
        self.context_engine = Some(engine);
        self
    }

    pub fn build(self) -> CoreResult<HybridAgent> {
        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(ToolExecutor::with_config(
                self.registry,
                self.cache_config,
                self.rate_config,
            ))
        });

        let llm = self.llm.map(|llm| match self.retry_count {
            Some(retries) => {
                Arc::new(RetryingLlmClient::new(llm, retries)) as Arc<dyn LlmClient>
            }
            None => llm,
        });

        HybridAgent::with_parts(
            self.agent_id,
            executor,
            llm,
            self.config,
            self.limits,
            self.cache_config,
            self.selector,
            self.capabilities,
            self.fallback,
            self.context_engine,
        )
    }
}
