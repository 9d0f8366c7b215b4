use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

use super::collaboration::{AgentRegistry, CollaborationStrategy, Collaborator, PeerReview};
use super::context::{ContextItem, ContextSelector, ScoredItem};
use super::core::{AgentCore, HookContext, HookKind};
use super::events::AgentEvent;
use super::learning::{Experience, LearningInsights, LearningStore, Recommendation, StrategyAdjustment};
use super::resources::{ResourceAvailability, ResourceUsage};
use super::{invoke_with_observation, TaskOutcome};
use crate::cancel::CancelToken;
use crate::config::{LlmConfig, ResourceLimitsConfig, ToolCacheConfig};
use crate::context_engine::ContextEngine;
use crate::error::{CoreError, CoreResult};
use crate::llm::{ChatMessage, LlmClient, LlmOptions, LlmToolCall, StreamChunk, ToolChoice};
use crate::tools::{CacheStats, InvokeOptions, ToolCache, ToolExecutor, ToolObservation};
use crate::types::{ExecutionContext, ExecutionStatus, Task};

/// Fallback executor tried by the `Fallback` recovery strategy.
pub type FallbackFn =
    Arc<dyn Fn(Task) -> BoxFuture<'static, CoreResult<TaskOutcome>> + Send + Sync>;

/// Tunables of the hybrid loop.
#[derive(Clone)]
pub struct HybridConfig {
    /// Cap on LLM → tools → feedback rounds per task.
    pub max_iterations:     u32,
    pub max_parallel_tools: usize,
    pub llm:                LlmConfig,
    pub system_prompt:      String,
    pub learning_enabled:   bool,
    /// How long the resource gate waits before giving up.
    pub resource_wait:      Duration,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            max_iterations:     5,
            max_parallel_tools: 5,
            llm:                LlmConfig::default(),
            system_prompt:      "You are a capable assistant. Use the available tools when they \
                                 help, then answer concisely."
                .to_string(),
            learning_enabled:   true,
            resource_wait:      Duration::from_secs(5),
        }
    }
}

/// The hybrid agent: LLM reasoning, function calling, cached parallel tool
/// execution, collaboration and recovery in one execution loop.
///
/// A task naming an explicit tool takes the direct path; everything else
/// goes through the LLM loop: context selection, prompt assembly, LLM call
/// with tool schemas, dependency-aware parallel tool execution through the
/// per-agent cache, observation feedback, bounded by `max_iterations`.
pub struct HybridAgent {
    pub(super) core:          Arc<AgentCore>,
    pub(super) executor:      Arc<ToolExecutor>,
    pub(super) llm:           Option<Arc<dyn LlmClient>>,
    pub(super) config:        HybridConfig,
    pub(super) fallback:      Option<FallbackFn>,
    cache:          ToolCache,
    selector:       ContextSelector,
    context_items:  Mutex<Vec<ContextItem>>,
    learning:       LearningStore,
    capabilities:   Vec<String>,
    context_engine: Option<Arc<dyn ContextEngine>>,
    session_id:     String,
}

impl HybridAgent {
    pub fn new(agent_id: impl Into<String>, executor: Arc<ToolExecutor>) -> CoreResult<Self> {
        Self::with_parts(
            agent_id,
            executor,
            None,
            HybridConfig::default(),
            ResourceLimitsConfig::default(),
            ToolCacheConfig::default(),
            ContextSelector::default(),
            Vec::new(),
            None,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn with_parts(
        agent_id: impl Into<String>,
        executor: Arc<ToolExecutor>,
        llm: Option<Arc<dyn LlmClient>>,
        config: HybridConfig,
        limits: ResourceLimitsConfig,
        cache_config: ToolCacheConfig,
        selector: ContextSelector,
        capabilities: Vec<String>,
        fallback: Option<FallbackFn>,
        context_engine: Option<Arc<dyn ContextEngine>>,
    ) -> CoreResult<Self> {
        let core = Arc::new(AgentCore::new(agent_id, limits));
        core.initialize()?;
        let session_id = uuid::Uuid::new_v4().to_string();
        Ok(Self {
            core,
            executor,
            llm,
            config,
            fallback,
            cache: ToolCache::new(cache_config),
            selector,
            context_items: Mutex::new(Vec::new()),
            learning: LearningStore::new(),
            capabilities,
            context_engine,
            session_id,
        })
    }

    pub fn core(&self) -> &Arc<AgentCore> {
        &self.core
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // ── Task execution ──────────────────────────────────────────────────

    pub async fn execute_task(&self, task: &Task, ctx: &ExecutionContext) -> CoreResult<TaskOutcome> {
        self.execute_task_inner(task, ctx, None).await
    }

    /// Streaming variant; tokens and tool events arrive on `events`.
    pub async fn execute_task_streaming(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        events: UnboundedSender<AgentEvent>,
    ) -> CoreResult<TaskOutcome> {
        self.execute_task_inner(task, ctx, Some(events)).await
    }

    async fn execute_task_inner(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        events: Option<UnboundedSender<AgentEvent>>,
    ) -> CoreResult<TaskOutcome> {
        // Resource gate.
        let availability = self.check_resource_availability();
        if !availability.available && !self.wait_for_resources(self.config.resource_wait).await {
            return Err(CoreError::ResourceExhausted(
                availability.reason.unwrap_or_else(|| "resource budget exhausted".to_string()),
            ));
        }

        let guard = AgentCore::begin_task(&self.core, "hybrid_task")?;
        let cancel = guard.cancel_token();
        let step = self.core.next_step();
        self.core.log("task", "TASK_START", &task.description);

        self.core.run_hooks(
            HookKind::PreExecution,
            &HookContext {
                agent_id: self.core.agent_id(),
                task,
                result: None,
                error: None,
            },
        );

        let started = Instant::now();
        let approach = if task.is_direct() { "direct_tool" } else { "llm_loop" };
        let outcome = if task.is_direct() {
            self.execute_direct(task, events.as_ref()).await
        } else {
            self.execute_llm_loop(task, ctx, &cancel, events.as_ref()).await
        };
        let elapsed = started.elapsed().as_secs_f64();

        match &outcome {
            Ok(result) => {
                if let Some(tx) = &events {
                    let _ = tx.send(AgentEvent::Result {
                        success: result.success,
                        payload: result.output.clone().unwrap_or(Value::Null),
                    });
                }
                self.core.run_hooks(
                    HookKind::PostExecution,
                    &HookContext {
                        agent_id: self.core.agent_id(),
                        task,
                        result: Some(result),
                        error: None,
                    },
                );
                self.core
                    .log("task", "TASK_DONE", &format!("step={} success={}", step, result.success));
                if self.config.learning_enabled {
                    self.record_experience(Experience {
                        task_type:      task.task_type.clone().unwrap_or_else(|| "default".into()),
                        success:        result.success,
                        execution_time: elapsed,
                        quality_score:  None,
                        approach:       approach.to_string(),
                        tools_used:     result
                            .observations
                            .iter()
                            .map(|o| o.tool_name.clone())
                            .collect(),
                        error_type:     result
                            .error
                            .as_ref()
                            .map(|_| "EXECUTION_ERROR".to_string()),
                        error_message:  result.error.clone(),
                        recorded_at:    Utc::now(),
                    });
                }
                guard.finish(if result.success {
                    ExecutionStatus::Completed
                } else {
                    ExecutionStatus::Failed
                });
            }
            Err(err) => {
                let message = err.to_string();
                if let Some(tx) = &events {
                    let _ = tx.send(AgentEvent::Error { message: message.clone() });
                }
                self.core.run_hooks(
                    HookKind::OnError,
                    &HookContext {
                        agent_id: self.core.agent_id(),
                        task,
                        result: None,
                        error: Some(&message),
                    },
                );
                if self.config.learning_enabled {
                    self.record_experience(Experience {
                        task_type:      task.task_type.clone().unwrap_or_else(|| "default".into()),
                        success:        false,
                        execution_time: elapsed,
                        quality_score:  None,
                        approach:       approach.to_string(),
                        tools_used:     Vec::new(),
                        error_type:     Some(err.code().as_str().to_string()),
                        error_message:  Some(message),
                        recorded_at:    Utc::now(),
                    });
                }
                guard.finish(match err {
                    CoreError::Cancelled(_) => ExecutionStatus::Cancelled,
                    CoreError::Timeout(_) => ExecutionStatus::TimedOut,
                    _ => ExecutionStatus::Failed,
                });
            }
        }

        outcome
    }

    async fn execute_direct(
        &self,
        task: &Task,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> CoreResult<TaskOutcome> {
        let tool = task.tool.as_deref().expect("direct task has a tool");
        let operation = task.operation.as_deref().expect("direct task has an operation");
        let params = task.parameters.clone().unwrap_or_else(|| json!({}));

        let call = crate::types::ToolCall::new(tool, params).with_operation(operation);
        if let Some(tx) = events {
            let _ = tx.send(AgentEvent::ToolCall {
                name:      format!("{}.{}", tool, operation),
                arguments: call.arguments.clone(),
            });
        }

        let observation = self.execute_tool_observed(&call).await;
        if let Some(tx) = events {
            let _ = tx.send(AgentEvent::ToolResult {
                name:    observation.tool_name.clone(),
                success: observation.success,
                result:  observation.result.clone().unwrap_or(Value::Null),
            });
        }

        Ok(if observation.success {
            let value = observation.result.clone().unwrap_or(Value::Null);
            TaskOutcome {
                success:           true,
                output:            Some(value.clone()),
                tool_calls_count:  0,
                tool_results:      vec![value],
                observations:      vec![observation],
                tool_used:         Some(tool.to_string()),
                error:             None,
                recovery_strategy: None,
            }
        } else {
            TaskOutcome {
                success:           false,
                output:            None,
                tool_calls_count:  0,
                tool_results:      Vec::new(),
                tool_used:         Some(tool.to_string()),
                error:             observation.error.clone(),
                observations:      vec![observation],
                recovery_strategy: None,
            }
        })
    }

    async fn execute_llm_loop(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        cancel: &CancelToken,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> CoreResult<TaskOutcome> {
        let llm = self.llm.as_ref().ok_or_else(|| {
            CoreError::Validation(
                "task names no tool and this agent has no LLM client configured".to_string(),
            )
        })?;

        // Context selection and prompt assembly.
        let mut messages = vec![ChatMessage::system(&self.config.system_prompt)];
        for scored in self.relevant_context(&task.description) {
            messages.push(ChatMessage::system(format!(
                "[context:{}] {}",
                scored.item.item_type, scored.item.content
            )));
        }
        if !ctx.input_data.is_null() {
            messages.push(ChatMessage::system(format!("Input data: {}", ctx.input_data)));
        }
        messages.push(ChatMessage::user(&task.description));

        let opts = LlmOptions {
            model:       Some(self.config.llm.model.clone()).filter(|m| !m.is_empty()),
            temperature: Some(self.config.llm.temperature),
            max_tokens:  Some(self.config.llm.max_tokens),
            tools:       self.executor.registry().function_schemas(),
            tool_choice: ToolChoice::Auto,
        };

        let mut all_observations = Vec::new();
        let mut all_tool_results = Vec::new();
        let mut tool_calls_total = 0usize;
        let mut final_output = String::new();

        for iteration in 0..self.config.max_iterations {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled("task cancelled".to_string()));
            }

            let reply = self.call_llm(llm.as_ref(), &messages, &opts, cancel, events).await?;
            final_output = reply.content.clone();

            if reply.tool_calls.is_empty() {
                break;
            }

            tracing::debug!(
                agent = %self.core.agent_id(),
                iteration,
                calls = reply.tool_calls.len(),
                "model requested tool calls"
            );
            if let Some(tx) = events {
                let _ = tx.send(AgentEvent::ToolCalls { count: reply.tool_calls.len() });
            }

            let calls = self.plan_calls(&reply.tool_calls)?;
            tool_calls_total += calls.len();
            let observations = self.execute_tools_with_dependencies_inner(&calls, events).await?;

            // Feed results back as messages for the next round.
            messages.push(ChatMessage::assistant(if reply.content.is_empty() {
                format!("[requested {} tool calls]", calls.len())
            } else {
                reply.content.clone()
            }));
            for (call, observation) in calls.iter().zip(&observations) {
                messages.push(ChatMessage::tool(observation.as_text(), call.id.clone()));
                if observation.success {
                    all_tool_results.push(json!({
                        "result": observation.result.clone().unwrap_or(Value::Null)
                    }));
                } else {
                    all_tool_results.push(json!({
                        "error": observation.error.clone().unwrap_or_default()
                    }));
                }
            }
            all_observations.extend(observations);
        }

        Ok(TaskOutcome {
            success:           true,
            output:            Some(Value::String(final_output)),
            tool_calls_count:  tool_calls_total,
            tool_results:      all_tool_results,
            observations:      all_observations,
            tool_used:         None,
            error:             None,
            recovery_strategy: None,
        })
    }

    async fn call_llm(
        &self,
        llm: &dyn LlmClient,
        messages: &[ChatMessage],
        opts: &LlmOptions,
        cancel: &CancelToken,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> CoreResult<crate::llm::LlmReply> {
        let reply = match events {
            None => llm.generate_text(messages, opts).await.map_err(CoreError::from)?,
            Some(tx) => {
                let mut stream = llm.stream_text(messages, opts);
                let mut content = String::new();
                let mut tool_calls: Vec<LlmToolCall> = Vec::new();
                let mut tokens_used = None;
                while let Some(chunk) = stream.next().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match chunk {
                        Ok(StreamChunk::Token(token)) => {
                            content.push_str(&token);
                            let _ = tx.send(AgentEvent::token(token));
                        }
                        Ok(StreamChunk::ToolCalls(calls)) => tool_calls = calls,
                        Ok(StreamChunk::Done { tokens_used: usage }) => tokens_used = usage,
                        Err(err) => return Err(CoreError::from(err)),
                    }
                }
                crate::llm::LlmReply {
                    content,
                    tool_calls,
                    tokens_used,
                    provider: llm.provider().to_string(),
                    model: opts.model.clone().unwrap_or_default(),
                }
            }
        };

        let amount = reply
            .tokens_used
            .map(u64::from)
            .unwrap_or_else(|| (reply.content.len() / 4) as u64);
        self.core.resources().record_tokens(amount);
        Ok(reply)
    }

    /// Map LLM function calls onto registry tools, inferring dependencies
    /// from `${result[i]...}` references in the arguments.
    fn plan_calls(&self, llm_calls: &[LlmToolCall]) -> CoreResult<Vec<crate::types::ToolCall>> {
        let mut calls = Vec::with_capacity(llm_calls.len());
        for llm_call in llm_calls {
            let (tool, operation) = self
                .executor
                .registry()
                .resolve_function(&llm_call.name)
                .ok_or_else(|| CoreError::ToolNotFound(llm_call.name.clone()))?;
            let arguments = llm_call.parsed_arguments();
            let depends_on = referenced_call_indices(&arguments);
            calls.push(
                crate::types::ToolCall::new(tool.name(), arguments)
                    .with_operation(operation)
                    .with_id(llm_call.id.clone())
                    .with_depends_on(depends_on),
            );
        }
        Ok(calls)
    }

    // ── Parallel tool execution ─────────────────────────────────────────

    /// Run independent calls concurrently. Results come back in call order;
    /// concurrency is `min(len, max_concurrency)`.
    pub async fn execute_tools_parallel(
        &self,
        calls: &[crate::types::ToolCall],
        max_concurrency: usize,
    ) -> Vec<ToolObservation> {
        let limit = max_concurrency.min(calls.len()).max(1);
        let mut call_futures = Vec::with_capacity(calls.len());
        for (index, call) in calls.iter().enumerate() {
            call_futures.push(async move { (index, self.execute_tool_observed(call).await) });
        }
        let mut indexed: Vec<(usize, ToolObservation)> = stream::iter(call_futures)
            .buffer_unordered(limit)
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, observation)| observation).collect()
    }

    /// Run a batch whose members may depend on earlier members, via
    /// explicit `depends_on` indices or `${result[i]...}` references.
    /// Dependent calls see their references substituted with the
    /// dependency's result.
    pub async fn execute_tools_with_dependencies(
        &self,
        calls: &[crate::types::ToolCall],
    ) -> CoreResult<Vec<ToolObservation>> {
        self.execute_tools_with_dependencies_inner(calls, None).await
    }

    async fn execute_tools_with_dependencies_inner(
        &self,
        calls: &[crate::types::ToolCall],
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> CoreResult<Vec<ToolObservation>> {
        let n = calls.len();
        let mut done: Vec<Option<ToolObservation>> = vec![None; n];
        let mut remaining: HashSet<usize> = (0..n).collect();

        // Effective dependencies: explicit `depends_on` plus any
        // `${result[i]...}` reference in the arguments.
        let deps: Vec<Vec<usize>> = calls
            .iter()
            .map(|call| {
                let mut deps = call.depends_on.clone();
                deps.extend(referenced_call_indices(&call.arguments));
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();

        while !remaining.is_empty() {
            let ready: Vec<usize> = {
                let mut ready: Vec<usize> = remaining
                    .iter()
                    .copied()
                    .filter(|&i| deps[i].iter().all(|&dep| dep >= n || done[dep].is_some()))
                    .collect();
                ready.sort_unstable();
                ready
            };
            if ready.is_empty() {
                return Err(CoreError::Planning(format!(
                    "unsatisfiable tool-call dependencies among indices {:?}",
                    remaining
                )));
            }

            let batch: Vec<crate::types::ToolCall> = ready
                .iter()
                .map(|&i| {
                    let mut call = calls[i].clone();
                    call.arguments = substitute_call_refs(&call.arguments, &done);
                    call
                })
                .collect();

            if let Some(tx) = events {
                for call in &batch {
                    let _ = tx.send(AgentEvent::ToolCall {
                        name: format!(
                            "{}.{}",
                            call.name,
                            call.operation.as_deref().unwrap_or("")
                        ),
                        arguments: call.arguments.clone(),
                    });
                }
            }

            let observations = self
                .execute_tools_parallel(&batch, self.config.max_parallel_tools)
                .await;

            for (&index, observation) in ready.iter().zip(observations) {
                if let Some(tx) = events {
                    let _ = tx.send(AgentEvent::ToolResult {
                        name:    observation.tool_name.clone(),
                        success: observation.success,
                        result:  observation.result.clone().unwrap_or(Value::Null),
                    });
                }
                done[index] = Some(observation);
                remaining.remove(&index);
            }
        }

        Ok(done.into_iter().map(|o| o.expect("all calls completed")).collect())
    }

    // ── Cached tool execution ───────────────────────────────────────────

    /// One tool invocation through the per-agent cache, always producing a
    /// [`ToolObservation`]. Cache hits skip execution entirely.
    pub async fn execute_tool_observed(&self, call: &crate::types::ToolCall) -> ToolObservation {
        let operation = match call.operation.clone() {
            Some(op) => op,
            None => match self
                .executor
                .registry()
                .get(&call.name)
                .and_then(|tool| tool.default_operation())
            {
                Some(op) => op,
                None => {
                    return ToolObservation::failure(
                        &call.name,
                        call.arguments.clone(),
                        format!("tool '{}' not found in registry", call.name),
                        0.0,
                    )
                }
            },
        };

        let opts = InvokeOptions {
            user_id: Some(self.core.agent_id().to_string()),
            task_id: None,
        };
        let key = ToolExecutor::cache_key(&call.name, &operation, &call.arguments, &opts);

        if let Some(cached) = self.cache.get(&key) {
            self.core.log("tool", "CACHE_HIT", &key);
            return ToolObservation::success(&call.name, call.arguments.clone(), cached, 0.0);
        }

        self.core.resources().record_tool_call();
        let (observation, result) =
            invoke_with_observation(&self.executor, &call.name, &operation, &call.arguments, opts)
                .await;
        if let Ok(value) = result {
            self.cache.insert(key, value, self.cache.default_ttl());
        }
        observation
    }

    /// Cache-through invocation without the observation wrapper.
    pub async fn execute_tool_with_cache(
        &self,
        tool: &str,
        operation: &str,
        params: Value,
    ) -> CoreResult<Value> {
        let call = crate::types::ToolCall::new(tool, params).with_operation(operation);
        let observation = self.execute_tool_observed(&call).await;
        match observation.result {
            Some(value) if observation.success => Ok(value),
            _ => Err(CoreError::Execution(
                observation.error.unwrap_or_else(|| "tool failed".to_string()),
            )),
        }
    }

    /// Invalidate by tool name, by substring pattern, or everything.
    pub fn invalidate_cache(&self, tool_name: Option<&str>, pattern: Option<&str>) -> usize {
        match (tool_name, pattern) {
            (Some(tool), _) => self.cache.invalidate_tool(tool),
            (None, Some(pattern)) => self.cache.invalidate_pattern(pattern),
            (None, None) => {
                let size = self.cache.len();
                self.cache.clear();
                size
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn force_cache_cleanup(&self) {
        self.cache.force_cleanup();
    }

    // ── Context management ──────────────────────────────────────────────

    pub fn add_context(&self, item: ContextItem) {
        self.context_items
            .lock()
            .expect("context lock poisoned")
            .push(item);
    }

    pub fn relevant_context(&self, task_description: &str) -> Vec<ScoredItem> {
        let items = self.context_items.lock().expect("context lock poisoned").clone();
        self.selector.select(task_description, &items)
    }

    /// Persist a context value for this session via the configured engine.
    pub async fn save_context(&self, key: &str, value: Value) -> CoreResult<()> {
        match &self.context_engine {
            Some(engine) => engine.put(&self.session_id, key, value).await,
            None => Err(CoreError::Validation("no context engine configured".to_string())),
        }
    }

    pub async fn load_context(&self, key: &str) -> CoreResult<Option<Value>> {
        match &self.context_engine {
            Some(engine) => engine.get(&self.session_id, key).await,
            None => Err(CoreError::Validation("no context engine configured".to_string())),
        }
    }

    // ── Learning ────────────────────────────────────────────────────────

    pub fn record_experience(&self, experience: Experience) {
        self.learning.record(experience);
    }

    pub fn recommended_approach(&self, task_type: &str) -> Option<Recommendation> {
        self.learning.recommended_approach(task_type)
    }

    pub fn learning_insights(&self) -> LearningInsights {
        self.learning.insights()
    }

    pub fn adapt_strategy(&self, task_type: &str) -> StrategyAdjustment {
        self.learning.adapt_strategy(task_type)
    }

    // ── Resource governance ─────────────────────────────────────────────

    pub fn check_resource_availability(&self) -> ResourceAvailability {
        self.core.resources().check_availability()
    }

    pub async fn wait_for_resources(&self, timeout: Duration) -> bool {
        self.core.resources().wait_for_resources(timeout).await
    }

    pub fn resource_usage(&self) -> ResourceUsage {
        self.core.resources().usage()
    }

    // ── Collaboration ───────────────────────────────────────────────────

    pub async fn delegate_task(
        &self,
        registry: &AgentRegistry,
        task: &Task,
        target_agent_id: &str,
    ) -> CoreResult<TaskOutcome> {
        let peer = registry.require(target_agent_id)?;
        self.core
            .log("collaboration", "DELEGATE", &format!("{} -> {}", task.task_id, target_agent_id));
        peer.handle_task(task.clone(), ExecutionContext::default()).await
    }

    pub fn find_capable_agents(&self, registry: &AgentRegistry, capabilities: &[String]) -> Vec<String> {
        registry
            .find_capable(capabilities)
            .into_iter()
            .filter(|id| id != self.core.agent_id())
            .collect()
    }

    pub async fn request_peer_review(
        &self,
        registry: &AgentRegistry,
        task: &Task,
        result: &Value,
        reviewer_id: &str,
    ) -> CoreResult<PeerReview> {
        registry.require(reviewer_id)?.review(task, result).await
    }

    /// Fan a task out to peers.
    ///
    /// `Parallel` runs all peers concurrently; `Sequential` pipes each
    /// peer's output into the next peer's context as `task_<i>_result`;
    /// `Consensus` runs all peers and reports the majority outcome.
    pub async fn collaborate_on_task(
        &self,
        registry: &AgentRegistry,
        task: &Task,
        collaborators: &[String],
        strategy: CollaborationStrategy,
    ) -> CoreResult<Value> {
        if collaborators.is_empty() {
            return Err(CoreError::Validation("no collaborators given".to_string()));
        }
        let peers: Vec<Arc<dyn Collaborator>> = collaborators
            .iter()
            .map(|id| registry.require(id))
            .collect::<CoreResult<_>>()?;

        match strategy {
            CollaborationStrategy::Parallel => {
                let outcomes = futures::future::join_all(
                    peers
                        .iter()
                        .map(|peer| peer.handle_task(task.clone(), ExecutionContext::default())),
                )
                .await;
                let results: Vec<Value> = outcomes
                    .into_iter()
                    .map(|outcome| match outcome {
                        Ok(o) => json!({"success": o.success, "output": o.output}),
                        Err(e) => json!({"success": false, "error": e.to_string()}),
                    })
                    .collect();
                Ok(json!({"strategy": "parallel", "results": results}))
            }
            CollaborationStrategy::Sequential => {
                let mut ctx = ExecutionContext::default();
                let mut results = Vec::new();
                for (index, peer) in peers.iter().enumerate() {
                    let outcome = peer.handle_task(task.clone(), ctx.clone()).await?;
                    let output = outcome.output.clone().unwrap_or(Value::Null);
                    ctx.variables
                        .insert(format!("task_{}_result", index), output.clone());
                    results.push(output);
                }
                Ok(json!({"strategy": "sequential", "results": results}))
            }
            CollaborationStrategy::Consensus => {
                let outcomes = futures::future::join_all(
                    peers
                        .iter()
                        .map(|peer| peer.handle_task(task.clone(), ExecutionContext::default())),
                )
                .await;
                let successes: Vec<Value> = outcomes
                    .iter()
                    .filter_map(|outcome| outcome.as_ref().ok())
                    .filter(|o| o.success)
                    .map(|o| o.output.clone().unwrap_or(Value::Null))
                    .collect();
                let agreed = successes.len() * 2 > peers.len();
                Ok(json!({
                    "strategy": "consensus",
                    "agreed": agreed,
                    "votes": successes.len(),
                    "total": peers.len(),
                    "results": successes,
                }))
            }
        }
    }
}

#[async_trait::async_trait]
impl Collaborator for HybridAgent {
    fn agent_id(&self) -> &str {
        self.core.agent_id()
    }

    fn capabilities(&self) -> Vec<String> {
        self.capabilities.clone()
    }

    async fn handle_task(&self, task: Task, ctx: ExecutionContext) -> CoreResult<TaskOutcome> {
        self.execute_task(&task, &ctx).await
    }

    async fn review(&self, task: &Task, result: &Value) -> CoreResult<PeerReview> {
        // Shallow structural review; an LLM-backed reviewer can be layered
        // on top via a peer with its own prompt.
        let approved = !result.is_null();
        Ok(PeerReview {
            approved,
            feedback: if approved {
                format!("result for '{}' looks well-formed", task.description)
            } else {
                "result is empty".to_string()
            },
            reviewer_id: self.core.agent_id().to_string(),
        })
    }
}

/// Indices named by `${result[i]...}` references anywhere in a value.
fn referenced_call_indices(value: &Value) -> Vec<usize> {
    let mut indices = Vec::new();
    fn visit(value: &Value, indices: &mut Vec<usize>) {
        match value {
            Value::String(s) => {
                let mut rest = s.as_str();
                while let Some(pos) = rest.find("${result[") {
                    let tail = &rest[pos + "${result[".len()..];
                    if let Some(end) = tail.find(']') {
                        if let Ok(index) = tail[..end].parse::<usize>() {
                            indices.push(index);
                        }
                        rest = &tail[end..];
                    } else {
                        break;
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| visit(v, indices)),
            Value::Object(map) => map.values().for_each(|v| visit(v, indices)),
            _ => {}
        }
    }
    visit(value, &mut indices);
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Substitute `${result[i]}` / `${result[i].path}` with completed results.
fn substitute_call_refs(value: &Value, done: &[Option<ToolObservation>]) -> Value {
    fn resolve(inner: &str, done: &[Option<ToolObservation>]) -> Option<Value> {
        let tail = inner.strip_prefix("result[")?;
        let close = tail.find(']')?;
        let index: usize = tail[..close].parse().ok()?;
        let mut current = done.get(index)?.as_ref()?.result.clone()?;
        let mut path = &tail[close + 1..];
        while let Some(rest) = path.strip_prefix('.') {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            current = current.get(&rest[..end])?.clone();
            path = &rest[end..];
        }
        Some(current)
    }

    match value {
        Value::String(s) => {
            if s.starts_with("${") && s.ends_with('}') && s.matches("${").count() == 1 {
                if let Some(resolved) = resolve(&s[2..s.len() - 1], done) {
                    return resolved;
                }
                return value.clone();
            }
            let mut out = String::with_capacity(s.len());
            let mut rest = s.as_str();
            while let Some(start) = rest.find("${") {
                out.push_str(&rest[..start]);
                let tail = &rest[start..];
                match tail.find('}') {
                    Some(end) => {
                        match resolve(&tail[2..end], done) {
                            Some(Value::String(text)) => out.push_str(&text),
                            Some(other) => out.push_str(&other.to_string()),
                            None => out.push_str(&tail[..=end]),
                        }
                        rest = &tail[end + 1..];
                    }
                    None => {
                        out.push_str(tail);
                        rest = "";
                    }
                }
            }
            out.push_str(rest);
            Value::String(out)
        }
        Value::Array(items) => Value::Array(
            items.iter().map(|v| substitute_call_refs(v, done)).collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_call_refs(v, done)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmReply, MockLlmClient};
    use crate::tools::builtin::{CalculatorTool, TextTool};
    use crate::tools::ToolRegistry;
    use crate::types::ToolCall;

    fn executor() -> Arc<ToolExecutor> {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(CalculatorTool::new()));
        registry.register(Arc::new(TextTool::new()));
        Arc::new(ToolExecutor::new(registry))
    }

    fn agent() -> HybridAgent {
        HybridAgent::new("hybrid-1", executor()).unwrap()
    }

    fn agent_with_llm(replies: Vec<LlmReply>) -> (HybridAgent, Arc<MockLlmClient>) {
        let mock = Arc::new(MockLlmClient::new(replies));
        let mut agent = agent();
        agent.llm = Some(mock.clone());
        (agent, mock)
    }

    #[tokio::test]
    async fn direct_path_skips_the_llm() {
        let (agent, mock) = agent_with_llm(vec![]);
        let task = Task::direct("calculator", "add", json!({"a": 5, "b": 3}));
        let outcome = agent.execute_task(&task, &ExecutionContext::default()).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.output, Some(json!(8)));
        assert_eq!(outcome.tool_used.as_deref(), Some("calculator"));
        assert_eq!(outcome.observations.len(), 1);
        assert_eq!(mock.call_count(), 0, "direct path must not call the LLM");
    }

    #[tokio::test]
    async fn llm_loop_runs_function_calls_then_finishes() {
        let round1 = LlmReply::text("").with_tool_calls(vec![crate::llm::LlmToolCall::new(
            "c1",
            "calculator.add",
            r#"{"a":7,"b":8}"#,
        )]);
        let round2 = LlmReply::text("The sum is 15.");
        let (agent, mock) = agent_with_llm(vec![round1, round2]);

        let outcome = agent
            .execute_task(&Task::new("add seven and eight"), &ExecutionContext::default())
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.tool_calls_count, 1);
        assert_eq!(outcome.tool_results[0], json!({"result": 15}));
        assert_eq!(outcome.output, Some(json!("The sum is 15.")));
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn loop_is_bounded_by_max_iterations() {
        // Model that always asks for another tool call.
        let replies: Vec<LlmReply> = (0..10)
            .map(|i| {
                LlmReply::text("").with_tool_calls(vec![crate::llm::LlmToolCall::new(
                    format!("c{}", i),
                    "calculator.add",
                    format!(r#"{{"a":{},"b":1}}"#, i),
                )])
            })
            .collect();
        let (agent, mock) = agent_with_llm(replies);

        let outcome = agent
            .execute_task(&Task::new("loop forever"), &ExecutionContext::default())
            .await
            .unwrap();

        assert_eq!(mock.call_count(), 5, "default max_iterations is 5");
        assert_eq!(outcome.tool_calls_count, 5);
    }

    #[tokio::test]
    async fn parallel_tools_preserve_call_order() {
        let agent = agent();
        let calls: Vec<ToolCall> = (0..5)
            .map(|i| {
                ToolCall::new("calculator", json!({"a": i, "b": i}))
                    .with_operation("add")
            })
            .collect();

        let observations = agent.execute_tools_parallel(&calls, 5).await;
        assert_eq!(observations.len(), 5);
        for (i, obs) in observations.iter().enumerate() {
            assert!(obs.success);
            assert_eq!(obs.result, Some(json!(i as i64 * 2)), "order preserved at {}", i);
        }
    }

    #[tokio::test]
    async fn dependent_calls_receive_substituted_results() {
        let agent = agent();
        let calls = vec![
            ToolCall::new("calculator", json!({"a": 2, "b": 3})).with_operation("add"),
            ToolCall::new("calculator", json!({"a": "${result[0]}", "b": 10}))
                .with_operation("multiply"),
        ];
        let observations = agent.execute_tools_with_dependencies(&calls).await.unwrap();
        assert_eq!(observations[0].result, Some(json!(5)));
        assert_eq!(observations[1].result, Some(json!(50)));
    }

    #[tokio::test]
    async fn dependency_cycle_is_a_planning_error() {
        let agent = agent();
        let calls = vec![
            ToolCall::new("calculator", json!({"a": 1, "b": 1}))
                .with_operation("add")
                .with_depends_on(vec![1]),
            ToolCall::new("calculator", json!({"a": 1, "b": 1}))
                .with_operation("add")
                .with_depends_on(vec![0]),
        ];
        let err = agent.execute_tools_with_dependencies(&calls).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Planning);
    }

    #[tokio::test]
    async fn cache_hit_skips_execution_and_records_observation() {
        let agent = agent();
        let call = ToolCall::new("calculator", json!({"a": 4, "b": 4})).with_operation("add");

        let first = agent.execute_tool_observed(&call).await;
        let second = agent.execute_tool_observed(&call).await;

        assert_eq!(first.result, second.result);
        let stats = agent.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_accesses, 1);
    }

    #[tokio::test]
    async fn invalidate_cache_by_tool_shrinks_size() {
        let agent = agent();
        for i in 0..3 {
            let call = ToolCall::new("calculator", json!({"a": i, "b": 1})).with_operation("add");
            agent.execute_tool_observed(&call).await;
        }
        let call = ToolCall::new("text", json!({"text": "x"})).with_operation("uppercase");
        agent.execute_tool_observed(&call).await;

        let before = agent.cache_stats().size;
        let removed = agent.invalidate_cache(Some("calculator"), None);
        assert_eq!(removed, 3);
        assert_eq!(agent.cache_stats().size, before - 3);
    }

    #[tokio::test]
    async fn context_items_shape_the_prompt() {
        let (agent, mock) = agent_with_llm(vec![LlmReply::text("done")]);
        agent.add_context(ContextItem::new("memory", "quarterly revenue numbers live in ledger"));
        agent.add_context(ContextItem::new("memory", "completely unrelated trivia"));

        agent
            .execute_task(
                &Task::new("summarize quarterly revenue numbers"),
                &ExecutionContext::default(),
            )
            .await
            .unwrap();

        // system prompt + 1 relevant context item + user message.
        let call = mock.call(0).unwrap();
        assert_eq!(call.message_count, 3);
    }

    #[tokio::test]
    async fn experiences_are_recorded_per_task() {
        let (agent, _mock) = agent_with_llm(vec![LlmReply::text("ok")]);
        agent
            .execute_task(
                &Task::new("anything").with_task_type("research"),
                &ExecutionContext::default(),
            )
            .await
            .unwrap();

        let insights = agent.learning_insights();
        assert_eq!(insights.total_experiences, 1);
        assert!(insights.by_task_type.contains_key("research"));
        let rec = agent.recommended_approach("research").unwrap();
        assert_eq!(rec.approach, "llm_loop");
    }

    #[tokio::test]
    async fn collaboration_sequential_pipes_outputs() {
        use crate::agent::collaboration::test_support::StubAgent;
        let agent = agent();
        let registry = AgentRegistry::new();
        registry.register(Arc::new(StubAgent::ok("p1", &[])));
        registry.register(Arc::new(StubAgent::ok("p2", &[])));

        let result = agent
            .collaborate_on_task(
                &registry,
                &Task::new("draft"),
                &["p1".to_string(), "p2".to_string()],
                CollaborationStrategy::Sequential,
            )
            .await
            .unwrap();
        assert_eq!(result["strategy"], json!("sequential"));
        assert_eq!(result["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delegate_to_unknown_peer_fails() {
        let agent = agent();
        let registry = AgentRegistry::new();
        let err = agent
            .delegate_task(&registry, &Task::new("x"), "ghost")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn referenced_indices_parse() {
        let value = json!({"a": "${result[0]}", "b": "use ${result[2].count} now"});
        assert_eq!(referenced_call_indices(&value), vec![0, 2]);
    }
}
