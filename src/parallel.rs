use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{Mutex, Semaphore};

use crate::cancel::CancelToken;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::tools::{InvokeOptions, ToolExecutor};
use crate::types::{ExecutionContext, ExecutionPlan, ExecutionResult, PlanStep};

/// Scheduler-internal lifecycle of one task node. A node never re-enters
/// `Running`; dependents of a failed node become `Skipped`, not `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One node of the execution graph.
#[derive(Debug, Clone)]
pub struct TaskNode {
    pub task_id:      String,
    pub definition:   Value,
    pub resources:    Vec<String>,
    pub dependencies: HashSet<String>,
    pub dependents:   HashSet<String>,
    pub state:        NodeState,
    pub result:       Option<ExecutionResult>,
    pub started_at:   Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Custom step runner: `(step, context) -> result value`.
pub type StepRunner =
    Arc<dyn Fn(PlanStep, ExecutionContext) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Report of one plan execution.
#[derive(Debug)]
pub struct ParallelRunReport {
    /// Results in completion order.
    pub results:     Vec<ExecutionResult>,
    pub node_states: HashMap<String, NodeState>,
    pub batches:     usize,
    pub cancelled:   bool,
}

/// Outcome of [`ParallelEngine::validate_execution_plan`].
#[derive(Debug, Clone)]
pub struct PlanValidation {
    pub valid:    bool,
    pub errors:   Vec<String>,
    pub warnings: Vec<String>,
}

/// Dependency-aware batch scheduler.
///
/// Builds a task graph from an [`ExecutionPlan`], repeatedly selects the
/// nodes whose dependencies are all completed, and runs each batch under a
/// shared semaphore, streaming results in completion order. An unschedulable
/// remainder is a deadlock and fails the plan with a planning error.
///
/// Named resources are acquired in declaration order before a step runs;
/// avoiding cross-step acquisition-order deadlocks is the caller's
/// responsibility.
pub struct ParallelEngine {
    executor:             Arc<ToolExecutor>,
    max_concurrent_tasks: usize,
    resource_locks:       Mutex<HashMap<String, Arc<Mutex<()>>>>,
    runner:               Option<StepRunner>,
}

impl ParallelEngine {
    pub fn new(executor: Arc<ToolExecutor>, max_concurrent_tasks: usize) -> Self {
        Self {
            executor,
            max_concurrent_tasks: max_concurrent_tasks.max(1),
            resource_locks: Mutex::new(HashMap::new()),
            runner: None,
        }
    }

    /// Replace the default tool-dispatch step runner.
    pub fn with_runner(mut self, runner: StepRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Build the task graph, reverse-indexing `dependents`.
    pub fn build_graph(&self, plan: &ExecutionPlan) -> HashMap<String, TaskNode> {
        let mut graph: HashMap<String, TaskNode> = plan
            .steps
            .iter()
            .map(|step| {
                let dependencies: HashSet<String> = plan
                    .dependencies
                    .get(&step.step_id)
                    .map(|deps| deps.iter().cloned().collect())
                    .unwrap_or_default();
                (
                    step.step_id.clone(),
                    TaskNode {
                        task_id:      step.step_id.clone(),
                        definition:   step.definition.clone(),
                        resources:    step.resources.clone(),
                        dependencies,
                        dependents:   HashSet::new(),
                        state:        NodeState::Pending,
                        result:       None,
                        started_at:   None,
                        completed_at: None,
                    },
                )
            })
            .collect();

        let edges: Vec<(String, String)> = graph
            .values()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(|dep| (dep.clone(), node.task_id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (dep, dependent) in edges {
            if let Some(node) = graph.get_mut(&dep) {
                node.dependents.insert(dependent);
            }
        }
        graph
    }

    /// Execute a plan. Results stream through `events` (when provided) and
    /// are returned in completion order.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        ctx: &ExecutionContext,
        cancel: CancelToken,
        events: Option<UnboundedSender<ExecutionResult>>,
    ) -> CoreResult<ParallelRunReport> {
        let mut graph = self.build_graph(plan);
        let mut results = Vec::new();
        let mut batches = 0usize;
        let mut cancelled = false;

        loop {
            if cancel.is_cancelled() {
                cancelled = true;
                for node in graph.values_mut() {
                    if node.state == NodeState::Pending {
                        node.state = NodeState::Skipped;
                    }
                }
                break;
            }

            propagate_skips(&mut graph);

            let ready: Vec<String> = {
                let mut ready: Vec<String> = graph
                    .values()
                    .filter(|node| {
                        node.state == NodeState::Pending
                            && node.dependencies.iter().all(|dep| {
                                graph
                                    .get(dep)
                                    .map(|d| d.state == NodeState::Completed)
                                    .unwrap_or(false)
                            })
                    })
                    .map(|node| node.task_id.clone())
                    .collect();
                ready.sort();
                ready
            };

            let pending_remain = graph
                .values()
                .any(|node| node.state == NodeState::Pending);
            if ready.is_empty() {
                if pending_remain {
                    let stuck: Vec<String> = graph
                        .values()
                        .filter(|n| n.state == NodeState::Pending)
                        .map(|n| n.task_id.clone())
                        .collect();
                    return Err(CoreError::Planning(format!(
                        "deadlock detected in execution graph, remaining tasks: {:?}",
                        stuck
                    )));
                }
                break;
            }

            batches += 1;
            let semaphore = Arc::new(Semaphore::new(
                ready.len().min(self.max_concurrent_tasks),
            ));

            let mut in_flight: FuturesUnordered<_> = ready
                .iter()
                .map(|task_id| {
                    let node = graph.get_mut(task_id).expect("ready node exists");
                    node.state = NodeState::Running;
                    node.started_at = Some(Utc::now());
                    let step = PlanStep {
                        step_id:    node.task_id.clone(),
                        definition: node.definition.clone(),
                        resources:  node.resources.clone(),
                    };
                    let semaphore = Arc::clone(&semaphore);
                    async move {
                        let _permit = semaphore.acquire().await.expect("semaphore never closed");
                        let result = self.run_step(step.clone(), ctx.clone()).await;
                        (step.step_id, result)
                    }
                })
                .collect();

            let mut batch_results = Vec::new();
            while let Some((task_id, result)) = in_flight.next().await {
                if let Some(tx) = &events {
                    let _ = tx.send(result.clone());
                }
                batch_results.push((task_id, result));
            }
            drop(in_flight);

            for (task_id, result) in batch_results {
                let node = graph.get_mut(&task_id).expect("node exists");
                node.completed_at = Some(result.completed_at);
                node.state = if result.success {
                    NodeState::Completed
                } else {
                    NodeState::Failed
                };
                node.result = Some(result.clone());
                results.push(result);
            }
        }

        Ok(ParallelRunReport {
            results,
            node_states: graph
                .iter()
                .map(|(id, node)| (id.clone(), node.state))
                .collect(),
            batches,
            cancelled,
        })
    }

    async fn run_step(&self, step: PlanStep, ctx: ExecutionContext) -> ExecutionResult {
        let started = Utc::now();
        let execution_id = ctx.execution_id.clone();
        let step_id = step.step_id.clone();

        // Hold the named mutexes, in declaration order, for the whole run.
        let mut guards = Vec::new();
        for resource in &step.resources {
            let lock = {
                let mut locks = self.resource_locks.lock().await;
                Arc::clone(
                    locks
                        .entry(resource.clone())
                        .or_insert_with(|| Arc::new(Mutex::new(()))),
                )
            };
            guards.push(lock.lock_owned().await);
        }

        let timeout = step.definition.get("timeout").and_then(Value::as_f64);
        let body = self.run_step_body(&step, &ctx);
        let outcome = match timeout {
            Some(secs) => match tokio::time::timeout(Duration::from_secs_f64(secs), body).await {
                Ok(inner) => inner,
                Err(_) => {
                    drop(guards);
                    return ExecutionResult::failed(
                        execution_id,
                        ErrorCode::Timeout,
                        format!("step {} timed out after {:.1}s", step_id, secs),
                        started,
                    )
                    .with_step_id(step_id);
                }
            },
            None => body.await,
        };
        drop(guards);

        match outcome {
            Ok(value) => ExecutionResult::completed(
                execution_id,
                format!("step {} completed", step_id),
                Some(value),
                started,
            )
            .with_step_id(step_id),
            Err(message) => ExecutionResult::failed(
                execution_id,
                ErrorCode::Execution,
                format!("step {} failed: {}", step_id, message),
                started,
            )
            .with_step_id(step_id),
        }
    }

    async fn run_step_body(&self, step: &PlanStep, ctx: &ExecutionContext) -> Result<Value, String> {
        if let Some(runner) = &self.runner {
            return runner(step.clone(), ctx.clone()).await;
        }

        let definition = &step.definition;
        if let (Some(tool), Some(operation)) = (
            definition.get("tool").and_then(Value::as_str),
            definition.get("operation").and_then(Value::as_str),
        ) {
            let params = definition
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default()));
            return self
                .executor
                .invoke(
                    tool,
                    operation,
                    params,
                    InvokeOptions {
                        user_id: None,
                        task_id: Some(step.step_id.clone()),
                    },
                )
                .await
                .map_err(|e| e.to_string());
        }

        // No tool reference: echo the definition so dry plans still flow.
        Ok(json!({"step": step.step_id, "definition": definition}))
    }

    /// Static plan checks: circular dependencies are errors; resource
    /// conflicts and over-wide parallel groups are warnings.
    pub fn validate_execution_plan(&self, plan: &ExecutionPlan) -> PlanValidation {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let step_ids: HashSet<&String> = plan.steps.iter().map(|s| &s.step_id).collect();
        for (step_id, deps) in &plan.dependencies {
            if !step_ids.contains(step_id) {
                errors.push(format!("dependency entry references unknown step: {}", step_id));
            }
            for dep in deps {
                if !step_ids.contains(dep) {
                    errors.push(format!("unknown dependency: {} required by {}", dep, step_id));
                }
            }
        }

        for cycle in detect_cycles(&plan.dependencies) {
            errors.push(format!("circular dependency detected: {}", cycle.join(" -> ")));
        }

        let mut resource_users: HashMap<&String, &String> = HashMap::new();
        for step in &plan.steps {
            for resource in &step.resources {
                match resource_users.get(resource) {
                    Some(existing) => warnings.push(format!(
                        "resource conflict: '{}' used by both {} and {}",
                        resource, existing, step.step_id
                    )),
                    None => {
                        resource_users.insert(resource, &step.step_id);
                    }
                }
            }
        }

        for (index, group) in plan.parallel_groups.iter().enumerate() {
            if group.len() > self.max_concurrent_tasks {
                warnings.push(format!(
                    "parallel group {} exceeds max concurrent tasks ({})",
                    index, self.max_concurrent_tasks
                ));
            }
        }

        PlanValidation {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Mark every pending node downstream of a failure as skipped, to fixpoint.
fn propagate_skips(graph: &mut HashMap<String, TaskNode>) {
    loop {
        let to_skip: Vec<String> = graph
            .values()
            .filter(|node| {
                node.state == NodeState::Pending
                    && node.dependencies.iter().any(|dep| {
                        graph
                            .get(dep)
                            .map(|d| matches!(d.state, NodeState::Failed | NodeState::Skipped))
                            .unwrap_or(false)
                    })
            })
            .map(|node| node.task_id.clone())
            .collect();
        if to_skip.is_empty() {
            return;
        }
        for task_id in to_skip {
            if let Some(node) = graph.get_mut(&task_id) {
                tracing::debug!(task = %task_id, "skipping dependent of failed node");
                node.state = NodeState::Skipped;
            }
        }
    }
}

fn detect_cycles(dependencies: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut visited = HashSet::new();
    let mut cycles = Vec::new();

    fn dfs(
        node: &str,
        dependencies: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) -> bool {
        if let Some(pos) = stack.iter().position(|n| n == node) {
            let mut cycle = stack[pos..].to_vec();
            cycle.push(node.to_string());
            cycles.push(cycle);
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node.to_string());
        stack.push(node.to_string());
        for dep in dependencies.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            if dfs(dep, dependencies, visited, stack, cycles) {
                stack.pop();
                return true;
            }
        }
        stack.pop();
        false
    }

    let mut nodes: Vec<&String> = dependencies.keys().collect();
    nodes.sort();
    for node in nodes {
        if !visited.contains(node.as_str()) {
            let mut stack = Vec::new();
            dfs(node, dependencies, &mut visited, &mut stack, &mut cycles);
        }
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::builtin::CalculatorTool;
    use crate::tools::ToolRegistry;

    fn engine(max_concurrent: usize) -> ParallelEngine {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(CalculatorTool::new()));
        ParallelEngine::new(Arc::new(ToolExecutor::new(registry)), max_concurrent)
    }

    fn calc_step(id: &str, a: i64, b: i64) -> PlanStep {
        PlanStep::new(
            id,
            json!({"tool": "calculator", "operation": "add", "parameters": {"a": a, "b": b}}),
        )
    }

    fn failing_step(id: &str) -> PlanStep {
        PlanStep::new(
            id,
            json!({"tool": "calculator", "operation": "divide", "parameters": {"a": 1, "b": 0}}),
        )
    }

    fn plan_with_deps(steps: Vec<PlanStep>, deps: Vec<(&str, Vec<&str>)>) -> ExecutionPlan {
        let mut plan = ExecutionPlan::new("wf", steps, "test");
        plan.dependencies = deps
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.into_iter().map(str::to_string).collect()))
            .collect();
        plan
    }

    #[tokio::test]
    async fn independent_tasks_run_in_one_batch() {
        let plan = plan_with_deps(
            vec![calc_step("a", 1, 1), calc_step("b", 2, 2), calc_step("c", 3, 3)],
            vec![],
        );
        let report = engine(5)
            .execute(&plan, &ExecutionContext::default(), CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(report.batches, 1);
        assert_eq!(report.results.len(), 3);
        assert!(report.results.iter().all(|r| r.success));
    }

    #[tokio::test]
    async fn dependencies_order_batches() {
        let plan = plan_with_deps(
            vec![calc_step("a", 1, 1), calc_step("b", 2, 2), calc_step("c", 3, 3)],
            vec![("b", vec!["a"]), ("c", vec!["b"])],
        );
        let report = engine(5)
            .execute(&plan, &ExecutionContext::default(), CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(report.batches, 3);

        // a.completed_at <= b.started_at for every dependency edge.
        let graph = engine(5).build_graph(&plan);
        assert!(graph["b"].dependencies.contains("a"));
        let by_id: HashMap<&str, &ExecutionResult> = report
            .results
            .iter()
            .map(|r| (r.step_id.as_deref().unwrap(), r))
            .collect();
        assert!(by_id["a"].completed_at <= by_id["b"].started_at);
        assert!(by_id["b"].completed_at <= by_id["c"].started_at);
    }

    #[tokio::test]
    async fn deadlock_is_a_planning_error() {
        let plan = plan_with_deps(
            vec![calc_step("a", 1, 1), calc_step("b", 2, 2)],
            vec![("a", vec!["b"]), ("b", vec!["a"])],
        );
        let err = engine(5)
            .execute(&plan, &ExecutionContext::default(), CancelToken::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Planning);
    }

    #[tokio::test]
    async fn dependents_of_failed_nodes_are_skipped() {
        let plan = plan_with_deps(
            vec![failing_step("a"), calc_step("b", 2, 2), calc_step("c", 3, 3)],
            vec![("b", vec!["a"]), ("c", vec![])],
        );
        let report = engine(5)
            .execute(&plan, &ExecutionContext::default(), CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(report.node_states["a"], NodeState::Failed);
        assert_eq!(report.node_states["b"], NodeState::Skipped);
        // Independent branch keeps scheduling.
        assert_eq!(report.node_states["c"], NodeState::Completed);
        // Skipped nodes yield no result.
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn transitive_skip_propagation() {
        let plan = plan_with_deps(
            vec![failing_step("a"), calc_step("b", 1, 1), calc_step("c", 1, 1)],
            vec![("b", vec!["a"]), ("c", vec!["b"])],
        );
        let report = engine(5)
            .execute(&plan, &ExecutionContext::default(), CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(report.node_states["b"], NodeState::Skipped);
        assert_eq!(report.node_states["c"], NodeState::Skipped);
    }

    #[tokio::test]
    async fn validate_reports_cycles_and_conflicts() {
        let mut plan = plan_with_deps(
            vec![
                calc_step("a", 1, 1).with_resources(vec!["db".into()]),
                calc_step("b", 2, 2).with_resources(vec!["db".into()]),
            ],
            vec![("a", vec!["b"]), ("b", vec!["a"])],
        );
        plan.parallel_groups = vec![vec!["a".into(), "b".into()]];

        let validation = engine(1).validate_execution_plan(&plan);
        assert!(!validation.valid);
        assert!(validation
            .errors
            .iter()
            .any(|e| e.contains("circular dependency")));
        assert!(validation
            .warnings
            .iter()
            .any(|w| w.contains("resource conflict")));
        assert!(validation
            .warnings
            .iter()
            .any(|w| w.contains("exceeds max concurrent")));
    }

    #[tokio::test]
    async fn unknown_dependency_fails_validation() {
        let plan = plan_with_deps(vec![calc_step("a", 1, 1)], vec![("a", vec!["ghost"])]);
        let validation = engine(5).validate_execution_plan(&plan);
        assert!(!validation.valid);
        assert!(validation.errors.iter().any(|e| e.contains("ghost")));
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_work() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let plan = plan_with_deps(vec![calc_step("a", 1, 1)], vec![]);
        let report = engine(5)
            .execute(&plan, &ExecutionContext::default(), cancel, None)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.node_states["a"], NodeState::Skipped);
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn resource_locks_serialize_holders() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static CONCURRENT: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);

        let runner: StepRunner = Arc::new(|_step, _ctx| {
            Box::pin(async {
                let now = CONCURRENT.fetch_add(1, Ordering::SeqCst) + 1;
                PEAK.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                CONCURRENT.fetch_sub(1, Ordering::SeqCst);
                Ok(json!("done"))
            })
        });

        let plan = plan_with_deps(
            vec![
                PlanStep::new("a", json!({})).with_resources(vec!["io".into()]),
                PlanStep::new("b", json!({})).with_resources(vec!["io".into()]),
            ],
            vec![],
        );
        let engine = engine(5).with_runner(runner);
        let report = engine
            .execute(&plan, &ExecutionContext::default(), CancelToken::new(), None)
            .await
            .unwrap();
        assert_eq!(report.results.len(), 2);
        // Both steps wanted "io"; the mutex kept them serial.
        assert_eq!(PEAK.load(Ordering::SeqCst), 1);
    }
}
