use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;

use super::expr::{self, EvalEnv};
use super::node::{DslNode, NodeKind, TaskNodeConfig};
use super::parser::DslParser;
use super::validator::{DslValidator, TaskInfo};
use crate::cancel::CancelToken;
use crate::config::DslConfig;
use crate::error::ErrorCode;
use crate::tools::{InvokeOptions, ToolExecutor};
use crate::types::{ExecutionContext, ExecutionPlan, ExecutionResult, PlanStep};

/// Async task handler: `(resolved task config, input data) -> result`.
pub type TaskHandler = Arc<
    dyn Fn(TaskNodeConfig, Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync,
>;

/// Everything a finished workflow run produced.
#[derive(Debug)]
pub struct DslRunOutcome {
    pub success:     bool,
    /// Leaf results (tasks and waits) in completion order.
    pub results:     Vec<ExecutionResult>,
    /// Aggregated result of the root sequence.
    pub root_result: ExecutionResult,
    pub context:     ExecutionContext,
    pub plan:        Option<ExecutionPlan>,
}

struct RunState {
    results: HashMap<String, Value>,
    ctx:     ExecutionContext,
    emitted: Vec<ExecutionResult>,
    events:  Option<UnboundedSender<ExecutionResult>>,
}

impl RunState {
    fn record(&mut self, node_id: &str, result: &ExecutionResult) {
        let payload = if result.success {
            result.result.clone().unwrap_or(Value::Null)
        } else {
            json!({
                "success": false,
                "error": result.error_message.clone().unwrap_or_default(),
            })
        };
        self.results.insert(node_id.to_string(), payload);
    }

    fn emit(&mut self, result: ExecutionResult) {
        if let Some(tx) = &self.events {
            let _ = tx.send(result.clone());
        }
        self.emitted.push(result);
    }
}

type SharedState = Arc<Mutex<RunState>>;

/// Executes validated workflow trees.
///
/// Task nodes resolve to a registered handler first, then to their first
/// `tool.operation` entry via the tool executor, and finally to an echoing
/// fallback. All node semantics (sequence/parallel/condition/loop/wait) run
/// under cooperative cancellation.
pub struct DslEngine {
    executor:     Arc<ToolExecutor>,
    handlers:     HashMap<String, TaskHandler>,
    task_catalog: HashMap<String, TaskInfo>,
    config:       DslConfig,
}

impl DslEngine {
    pub fn new(executor: Arc<ToolExecutor>) -> Self {
        Self {
            executor,
            handlers:     HashMap::new(),
            task_catalog: HashMap::new(),
            config:       DslConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DslConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register_task_handler(&mut self, task_name: impl Into<String>, handler: TaskHandler) {
        let task_name = task_name.into();
        self.task_catalog
            .entry(task_name.clone())
            .or_default();
        self.handlers.insert(task_name, handler);
    }

    /// Extend the validator's task catalog with metadata for tasks handled
    /// outside the registered handlers.
    pub fn set_task_catalog(&mut self, catalog: HashMap<String, TaskInfo>) {
        for (name, info) in catalog {
            self.task_catalog.insert(name, info);
        }
    }

    fn build_validator(&self) -> DslValidator {
        let mut validator = DslValidator::new().with_config(self.config);
        validator.set_available_tasks(self.task_catalog.clone());
        validator.set_available_tools(self.executor.registry().operation_names());
        validator
    }

    fn build_plan(&self, root: &DslNode, graph: &HashMap<String, Vec<String>>, order: &[String]) -> ExecutionPlan {
        let mut steps = Vec::new();
        for node_id in order {
            if let Some(node) = root.find(node_id) {
                steps.push(PlanStep::new(node_id.clone(), node.to_value()));
            }
        }
        let mut plan = ExecutionPlan::new(uuid::Uuid::new_v4().to_string(), steps, "dsl_engine");
        plan.dependencies = graph.clone();
        let mut parallel_groups = Vec::new();
        root.walk(&mut |node| {
            if matches!(node.kind, NodeKind::Parallel(_)) {
                parallel_groups.push(node.children.iter().map(|c| c.node_id.clone()).collect());
            }
        });
        plan.parallel_groups = parallel_groups;
        plan.validated = true;
        plan.optimized = true;
        plan
    }

    /// Parse, validate, plan and execute a workflow definition.
    ///
    /// A parse or validation failure surfaces exactly one FAILED result and
    /// nothing runs.
    pub async fn run(
        &self,
        definition: &Value,
        ctx: ExecutionContext,
        cancel: CancelToken,
    ) -> DslRunOutcome {
        self.run_with_events(definition, ctx, cancel, None).await
    }

    /// Like [`DslEngine::run`], additionally streaming each leaf result as
    /// it completes.
    pub async fn run_with_events(
        &self,
        definition: &Value,
        ctx: ExecutionContext,
        cancel: CancelToken,
        events: Option<UnboundedSender<ExecutionResult>>,
    ) -> DslRunOutcome {
        let started = Utc::now();
        let execution_id = ctx.execution_id.clone();

        let mut parser = DslParser::new().with_default_loop_cap(self.config.default_loop_cap);
        let parsed = parser.parse(definition);
        if !parsed.success {
            let failure = ExecutionResult::failed(
                execution_id,
                ErrorCode::Validation,
                format!("workflow parse failed: {}", parsed.errors.join("; ")),
                started,
            );
            return DslRunOutcome {
                success:     false,
                results:     Vec::new(),
                root_result: failure,
                context:     ctx,
                plan:        None,
            };
        }
        let root = parsed.root.expect("successful parse always yields a root");

        let validation = self.build_validator().validate(&root);
        if !validation.is_valid {
            let messages: Vec<String> = validation
                .errors()
                .map(|issue| issue.message.clone())
                .collect();
            let failure = ExecutionResult::failed(
                execution_id,
                ErrorCode::Validation,
                format!("workflow validation failed: {}", messages.join("; ")),
                started,
            );
            return DslRunOutcome {
                success:     false,
                results:     Vec::new(),
                root_result: failure,
                context:     ctx,
                plan:        None,
            };
        }

        let plan = self.build_plan(&root, &validation.dependency_graph, &validation.execution_order);

        tracing::info!(
            workflow = %plan.workflow_id,
            nodes = parsed.metadata.node_count,
            "executing workflow"
        );

        let workflow_timeout = ctx.timeout_seconds;
        let state: SharedState = Arc::new(Mutex::new(RunState {
            results: HashMap::new(),
            ctx,
            emitted: Vec::new(),
            events,
        }));

        let root_result = match workflow_timeout {
            Some(secs) => {
                match tokio::time::timeout(
                    Duration::from_secs_f64(secs),
                    self.exec_node(&root, &state, &cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => ExecutionResult::failed(
                        execution_id.clone(),
                        ErrorCode::Timeout,
                        format!("workflow timed out after {:.1}s", secs),
                        started,
                    ),
                }
            }
            None => self.exec_node(&root, &state, &cancel).await,
        };

        let state = Arc::try_unwrap(state)
            .map(Mutex::into_inner)
            .unwrap_or_else(|shared| {
                // A cancelled sibling may still hold a clone; snapshot instead.
                let guard = shared.try_lock();
                match guard {
                    Ok(inner) => RunState {
                        results: inner.results.clone(),
                        ctx:     inner.ctx.clone(),
                        emitted: inner.emitted.clone(),
                        events:  None,
                    },
                    Err(_) => RunState {
                        results: HashMap::new(),
                        ctx:     ExecutionContext::default(),
                        emitted: Vec::new(),
                        events:  None,
                    },
                }
            });

        DslRunOutcome {
            success:     root_result.success,
            results:     state.emitted,
            root_result,
            context:     state.ctx,
            plan:        Some(plan),
        }
    }

    fn exec_node<'a>(
        &'a self,
        node: &'a DslNode,
        state: &'a SharedState,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, ExecutionResult> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                let result = self
                    .cancelled_result(state, &node.node_id)
                    .await;
                return result;
            }
            match &node.kind {
                NodeKind::Task(config) => self.exec_task(node, config, state, cancel).await,
                NodeKind::Sequence => self.exec_sequence(node, state, cancel).await,
                NodeKind::Parallel(_) => self.exec_parallel(node, state, cancel).await,
                NodeKind::Condition(_) => self.exec_condition(node, state, cancel).await,
                NodeKind::Loop(_) => self.exec_loop(node, state, cancel).await,
                NodeKind::Wait(_) => self.exec_wait(node, state, cancel).await,
            }
        })
    }

    async fn cancelled_result(&self, state: &SharedState, node_id: &str) -> ExecutionResult {
        let execution_id = state.lock().await.ctx.execution_id.clone();
        ExecutionResult::failed(
            execution_id,
            ErrorCode::Cancelled,
            "execution cancelled",
            Utc::now(),
        )
        .with_step_id(node_id)
    }

    // ── Task ────────────────────────────────────────────────────────────

    async fn exec_task(
        &self,
        node: &DslNode,
        config: &TaskNodeConfig,
        state: &SharedState,
        _cancel: &CancelToken,
    ) -> ExecutionResult {
        let started = Utc::now();
        let (execution_id, resolved_params, input_data, guard_passed) = {
            let guard = state.lock().await;
            let resolved = resolve_value(&config.parameters, &guard.results, &guard.ctx.variables);
            let env = EvalEnv {
                results:   &guard.results,
                variables: &guard.ctx.variables,
            };
            let guard_passed = config
                .conditions
                .iter()
                .all(|condition| expr::evaluate_condition(condition, &env));
            (
                guard.ctx.execution_id.clone(),
                resolved,
                guard.ctx.input_data.clone(),
                guard_passed,
            )
        };

        if !guard_passed {
            let result = ExecutionResult::completed(
                execution_id,
                format!("task {} skipped: guard conditions not met", config.task_name),
                Some(json!({"skipped": true})),
                started,
            )
            .with_step_id(&node.node_id);
            let mut guard = state.lock().await;
            guard.record(&node.node_id, &result);
            guard.emit(result.clone());
            return result;
        }

        let attempts = config.retry_count + 1;
        let mut last_error = String::new();
        let mut outcome = None;

        for attempt in 0..attempts {
            let run = self.run_task_body(node, config, resolved_params.clone(), input_data.clone());
            let attempt_outcome = match config.timeout {
                Some(secs) => match tokio::time::timeout(Duration::from_secs_f64(secs), run).await {
                    Ok(inner) => inner,
                    Err(_) => Err(TaskError::Timeout(secs)),
                },
                None => run.await,
            };
            match attempt_outcome {
                Ok(value) => {
                    outcome = Some(value);
                    break;
                }
                Err(TaskError::Timeout(secs)) => {
                    let result = ExecutionResult::failed(
                        execution_id.clone(),
                        ErrorCode::Timeout,
                        format!("task {} timed out after {:.1}s", config.task_name, secs),
                        started,
                    )
                    .with_step_id(&node.node_id);
                    let mut guard = state.lock().await;
                    guard.record(&node.node_id, &result);
                    guard.emit(result.clone());
                    return result;
                }
                Err(TaskError::Failed(message)) => {
                    tracing::warn!(
                        task = %config.task_name,
                        attempt = attempt + 1,
                        error = %message,
                        "task attempt failed"
                    );
                    last_error = message;
                }
            }
        }

        let result = match outcome {
            Some(value) => ExecutionResult::completed(
                execution_id,
                format!("task {} completed", config.task_name),
                Some(value),
                started,
            )
            .with_step_id(&node.node_id),
            None => ExecutionResult::failed(
                execution_id,
                ErrorCode::Execution,
                format!("task {} failed: {}", config.task_name, last_error),
                started,
            )
            .with_step_id(&node.node_id),
        };

        let mut guard = state.lock().await;
        guard.record(&node.node_id, &result);
        guard.emit(result.clone());
        result
    }

    async fn run_task_body(
        &self,
        node: &DslNode,
        config: &TaskNodeConfig,
        params: Value,
        input_data: Value,
    ) -> Result<Value, TaskError> {
        if let Some(handler) = self.handlers.get(&config.task_name) {
            let mut resolved = config.clone();
            resolved.parameters = params;
            return handler(resolved, input_data).await.map_err(TaskError::Failed);
        }

        if let Some(tool_op) = config.tools.first() {
            let (tool, operation) = tool_op
                .split_once('.')
                .ok_or_else(|| TaskError::Failed(format!("invalid tool reference '{}'", tool_op)))?;
            return self
                .executor
                .invoke(
                    tool,
                    operation,
                    params,
                    InvokeOptions {
                        user_id: None,
                        task_id: Some(node.node_id.clone()),
                    },
                )
                .await
                .map_err(|e| TaskError::Failed(e.to_string()));
        }

        // No handler and no tools: echo the definition, as a dry run does.
        Ok(json!({"task": config.task_name, "tools": config.tools}))
    }

    // ── Sequence ────────────────────────────────────────────────────────

    async fn exec_sequence(
        &self,
        node: &DslNode,
        state: &SharedState,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        let started = Utc::now();
        let execution_id = state.lock().await.ctx.execution_id.clone();
        let mut child_results = Vec::new();
        let mut failed = false;

        for (index, child) in node.children.iter().enumerate() {
            if cancel.is_cancelled() {
                let result = self.cancelled_result(state, &node.node_id).await;
                let mut guard = state.lock().await;
                guard.record(&node.node_id, &result);
                return result;
            }

            let child_result = self.exec_node(child, state, cancel).await;
            {
                let mut guard = state.lock().await;
                guard.ctx.shared_data.insert(
                    format!("sequence_step_{}", index),
                    child_result.result.clone().unwrap_or(Value::Null),
                );
            }

            let stop = !child_result.success && !continues_on_failure(child);
            child_results.push(child_result.result.clone().unwrap_or(Value::Null));
            if stop {
                failed = true;
                break;
            }
        }

        let result = if failed {
            ExecutionResult::failed(
                execution_id,
                ErrorCode::Execution,
                format!(
                    "sequence stopped after step {} of {}",
                    child_results.len(),
                    node.children.len()
                ),
                started,
            )
            .with_step_id(&node.node_id)
        } else {
            ExecutionResult::completed(
                execution_id,
                format!("sequence of {} steps completed", child_results.len()),
                Some(json!({ "sequence_results": child_results })),
                started,
            )
            .with_step_id(&node.node_id)
        };

        state.lock().await.record(&node.node_id, &result);
        result
    }

    // ── Parallel ────────────────────────────────────────────────────────

    async fn exec_parallel(
        &self,
        node: &DslNode,
        state: &SharedState,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        let config = match &node.kind {
            NodeKind::Parallel(config) => config,
            _ => unreachable!("exec_parallel called on non-parallel node"),
        };
        let started = Utc::now();
        let execution_id = state.lock().await.ctx.execution_id.clone();

        let limit = config
            .max_concurrency
            .min(node.children.len())
            .max(1);

        let mut child_futures = Vec::with_capacity(node.children.len());
        for child in node.children.iter() {
            child_futures.push(self.exec_node(child, state, cancel));
        }
        let mut in_flight = stream::iter(child_futures).buffer_unordered(limit);

        let mut results = Vec::new();
        let mut failure_count = 0usize;
        while let Some(child_result) = in_flight.next().await {
            if !child_result.success {
                failure_count += 1;
            }
            let stop_early = (config.fail_fast && failure_count > 0) || !config.wait_for_all;
            results.push(child_result);
            if stop_early {
                // Dropping the stream cancels any siblings still in flight.
                break;
            }
        }
        drop(in_flight);

        let success = failure_count == 0;
        let payload = json!({
            "successful_count": results.iter().filter(|r| r.success).count(),
            "failed_count": failure_count,
            "parallel_results": results
                .iter()
                .map(|r| r.result.clone().unwrap_or(Value::Null))
                .collect::<Vec<_>>(),
        });

        let result = if success {
            ExecutionResult::completed(
                execution_id,
                format!("parallel block completed: {} results", results.len()),
                Some(payload),
                started,
            )
            .with_step_id(&node.node_id)
        } else {
            ExecutionResult::failed(
                execution_id,
                ErrorCode::Execution,
                format!(
                    "parallel block failed: {} of {} children failed",
                    failure_count,
                    results.len()
                ),
                started,
            )
            .with_step_id(&node.node_id)
        };

        state.lock().await.record(&node.node_id, &result);
        result
    }

    // ── Condition ───────────────────────────────────────────────────────

    async fn exec_condition(
        &self,
        node: &DslNode,
        state: &SharedState,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        let config = match &node.kind {
            NodeKind::Condition(config) => config,
            _ => unreachable!("exec_condition called on non-condition node"),
        };
        let started = Utc::now();

        let (execution_id, condition_result) = {
            let guard = state.lock().await;
            let env = EvalEnv {
                results:   &guard.results,
                variables: &guard.ctx.variables,
            };
            (
                guard.ctx.execution_id.clone(),
                expr::evaluate_condition(&config.condition, &env),
            )
        };

        let branch_name = if condition_result { "then" } else { "else" };
        let branch = node.branch(branch_name);

        let result = match branch {
            None => ExecutionResult::completed(
                execution_id,
                format!(
                    "condition evaluated to {}, no {} branch",
                    condition_result, branch_name
                ),
                Some(json!({"condition_result": condition_result, "executed": false})),
                started,
            )
            .with_step_id(&node.node_id),
            Some(branch_node) => {
                let branch_result = self.exec_node(branch_node, state, cancel).await;
                if branch_result.success {
                    ExecutionResult::completed(
                        execution_id,
                        format!("condition took {} branch", branch_name),
                        Some(json!({
                            "condition_result": condition_result,
                            "branch": branch_name,
                            "result": branch_result.result.clone().unwrap_or(Value::Null),
                        })),
                        started,
                    )
                    .with_step_id(&node.node_id)
                } else {
                    ExecutionResult::failed(
                        execution_id,
                        branch_result.error_code.unwrap_or(ErrorCode::Execution),
                        format!(
                            "condition {} branch failed: {}",
                            branch_name,
                            branch_result.error_message.clone().unwrap_or_default()
                        ),
                        started,
                    )
                    .with_step_id(&node.node_id)
                }
            }
        };

        state.lock().await.record(&node.node_id, &result);
        result
    }

    // ── Loop ────────────────────────────────────────────────────────────

    async fn exec_loop(
        &self,
        node: &DslNode,
        state: &SharedState,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        let config = match &node.kind {
            NodeKind::Loop(config) => config,
            _ => unreachable!("exec_loop called on non-loop node"),
        };
        let started = Utc::now();
        let execution_id = state.lock().await.ctx.execution_id.clone();
        let body = match node.children.first() {
            Some(body) => body,
            None => {
                return ExecutionResult::failed(
                    execution_id,
                    ErrorCode::Validation,
                    "loop has no body",
                    started,
                )
                .with_step_id(&node.node_id)
            }
        };

        let mut iterations = 0u32;
        let mut broke_on_error = false;

        while iterations < config.max_iterations {
            if cancel.is_cancelled() {
                return self.cancelled_result(state, &node.node_id).await;
            }
            let should_continue = {
                let guard = state.lock().await;
                let env = EvalEnv {
                    results:   &guard.results,
                    variables: &guard.ctx.variables,
                };
                expr::evaluate_condition(&config.condition, &env)
            };
            if !should_continue {
                break;
            }

            let body_result = self.exec_node(body, state, cancel).await;
            iterations += 1;

            {
                let mut guard = state.lock().await;
                guard.ctx.variables.insert(
                    "loop_iteration".to_string(),
                    json!(iterations),
                );
            }

            if !body_result.success && config.break_on_error {
                broke_on_error = true;
                break;
            }
        }

        let result = if broke_on_error {
            ExecutionResult::failed(
                execution_id,
                ErrorCode::Execution,
                format!("loop stopped on error after {} iterations", iterations),
                started,
            )
            .with_step_id(&node.node_id)
        } else {
            ExecutionResult::completed(
                execution_id,
                format!("loop completed after {} iterations", iterations),
                Some(json!({"iterations": iterations})),
                started,
            )
            .with_step_id(&node.node_id)
        };

        state.lock().await.record(&node.node_id, &result);
        result
    }

    // ── Wait ────────────────────────────────────────────────────────────

    async fn exec_wait(
        &self,
        node: &DslNode,
        state: &SharedState,
        cancel: &CancelToken,
    ) -> ExecutionResult {
        let config = match &node.kind {
            NodeKind::Wait(config) => config,
            _ => unreachable!("exec_wait called on non-wait node"),
        };
        let started = Utc::now();
        let execution_id = state.lock().await.ctx.execution_id.clone();
        let deadline = std::time::Instant::now() + Duration::from_secs_f64(config.timeout);

        loop {
            if cancel.is_cancelled() {
                let result = self.cancelled_result(state, &node.node_id).await;
                let mut guard = state.lock().await;
                guard.record(&node.node_id, &result);
                guard.emit(result.clone());
                return result;
            }

            let satisfied = {
                let guard = state.lock().await;
                let env = EvalEnv {
                    results:   &guard.results,
                    variables: &guard.ctx.variables,
                };
                expr::evaluate_condition(&config.condition, &env)
            };
            if satisfied {
                let result = ExecutionResult::completed(
                    execution_id,
                    "wait condition satisfied",
                    Some(json!({"satisfied": true})),
                    started,
                )
                .with_step_id(&node.node_id);
                let mut guard = state.lock().await;
                guard.record(&node.node_id, &result);
                guard.emit(result.clone());
                return result;
            }

            let now = std::time::Instant::now();
            if now >= deadline {
                let result = ExecutionResult::failed(
                    execution_id,
                    ErrorCode::Execution,
                    format!("wait condition not met within {:.1}s", config.timeout),
                    started,
                )
                .with_step_id(&node.node_id);
                let mut guard = state.lock().await;
                guard.record(&node.node_id, &result);
                guard.emit(result.clone());
                return result;
            }

            let poll = Duration::from_secs_f64(config.poll_interval);
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

enum TaskError {
    Failed(String),
    Timeout(f64),
}

fn continues_on_failure(node: &DslNode) -> bool {
    match &node.kind {
        NodeKind::Task(config) => config.continue_on_failure,
        _ => false,
    }
}

// ── Variable resolution ─────────────────────────────────────────────────

/// Resolve `${result.<id>.<path>}` and `${context.<name>}` templates in a
/// parameter tree. A string that is exactly one placeholder resolves to the
/// referenced value with its type intact; embedded placeholders splice in
/// the stringified value. Unresolved references stay literal.
pub fn resolve_value(
    value: &Value,
    results: &HashMap<String, Value>,
    variables: &HashMap<String, Value>,
) -> Value {
    match value {
        Value::String(s) => resolve_string(s, results, variables),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, results, variables))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, results, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup_placeholder(
    inner: &str,
    results: &HashMap<String, Value>,
    variables: &HashMap<String, Value>,
) -> Option<Value> {
    let mut parts = inner.split('.');
    match parts.next()? {
        "result" => {
            let node_id = parts.next()?;
            let mut current = results.get(node_id)?.clone();
            for field in parts {
                current = current.get(field)?.clone();
            }
            Some(current)
        }
        "context" => {
            let name = parts.next()?;
            let mut current = variables.get(name)?.clone();
            for field in parts {
                current = current.get(field)?.clone();
            }
            Some(current)
        }
        _ => None,
    }
}

fn splice(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_string(
    input: &str,
    results: &HashMap<String, Value>,
    variables: &HashMap<String, Value>,
) -> Value {
    // Whole-string placeholder: keep the referenced value's type.
    if input.starts_with("${") && input.ends_with('}') && input.matches("${").count() == 1 {
        let inner = &input[2..input.len() - 1];
        if let Some(resolved) = lookup_placeholder(inner, results, variables) {
            return resolved;
        }
        return Value::String(input.to_string());
    }

    // Two passes over the same string: result references first, then
    // context references. The second pass is redundant after the first but
    // is kept deliberately; observable semantics are identical.
    let pass1 = splice_pass(input, &|inner| {
        if inner.starts_with("result.") {
            lookup_placeholder(inner, results, variables)
        } else {
            None
        }
    });
    let pass2 = splice_pass(&pass1, &|inner| {
        if inner.starts_with("context.") {
            lookup_placeholder(inner, results, variables)
        } else {
            None
        }
    });
    Value::String(pass2)
}

fn splice_pass(input: &str, resolve: &dyn Fn(&str) -> Option<Value>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        match tail.find('}') {
            Some(end) => {
                let inner = &tail[2..end];
                match resolve(inner) {
                    Some(value) => out.push_str(&splice(&value)),
                    None => out.push_str(&tail[..=end]),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push_str(tail);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}
