use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ErrorCode;

/// Lifecycle status of one logical execution.
///
/// `Completed`, `Failed`, `TimedOut` and `Cancelled` are terminal; an
/// execution never leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    Paused,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
            Self::Paused => "PAUSED",
        };
        write!(f, "{}", s)
    }
}

/// A unit of work submitted to an agent. Immutable once submitted.
///
/// When `tool` and `operation` are set the task takes the direct-dispatch
/// path; otherwise the agent derives tool calls from `description` via the
/// LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    pub task_id:     String,
    pub tool:        Option<String>,
    pub operation:   Option<String>,
    pub parameters:  Option<Value>,
    pub task_type:   Option<String>,
    pub timeout:     Option<f64>,
    pub max_retries: Option<u32>,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            task_id:     uuid::Uuid::new_v4().to_string(),
            tool:        None,
            operation:   None,
            parameters:  None,
            task_type:   None,
            timeout:     None,
            max_retries: None,
        }
    }

    /// A task that names an explicit tool operation — takes the direct path.
    pub fn direct(
        tool: impl Into<String>,
        operation: impl Into<String>,
        parameters: Value,
    ) -> Self {
        let tool = tool.into();
        let operation = operation.into();
        Self {
            description: format!("{}.{}", tool, operation),
            task_id:     uuid::Uuid::new_v4().to_string(),
            tool:        Some(tool),
            operation:   Some(operation),
            parameters:  Some(parameters),
            task_type:   None,
            timeout:     None,
            max_retries: None,
        }
    }

    pub fn with_task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn is_direct(&self) -> bool {
        self.tool.is_some() && self.operation.is_some()
    }
}

/// Mutable state threaded through one logical execution.
///
/// Created by the submitter; mutated only by the owning executor. Callers
/// sharing a context across steps must namespace `shared_data` keys by step
/// id — concurrent writes to the same key are undefined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id:    String,
    pub input_data:      Value,
    pub shared_data:     HashMap<String, Value>,
    pub variables:       HashMap<String, Value>,
    pub timeout_seconds: Option<f64>,
}

impl ExecutionContext {
    pub fn new(input_data: Value) -> Self {
        Self {
            execution_id:    uuid::Uuid::new_v4().to_string(),
            input_data,
            shared_data:     HashMap::new(),
            variables:       HashMap::new(),
            timeout_seconds: None,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Value::Null)
    }
}

/// Outcome of one execution step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id:  String,
    pub step_id:       Option<String>,
    pub status:        ExecutionStatus,
    pub success:       bool,
    pub message:       String,
    pub result:        Option<Value>,
    pub error_code:    Option<ErrorCode>,
    pub error_message: Option<String>,
    pub started_at:    DateTime<Utc>,
    pub completed_at:  DateTime<Utc>,
}

impl ExecutionResult {
    pub fn completed(
        execution_id: impl Into<String>,
        message: impl Into<String>,
        result: Option<Value>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id:  execution_id.into(),
            step_id:       None,
            status:        ExecutionStatus::Completed,
            success:       true,
            message:       message.into(),
            result,
            error_code:    None,
            error_message: None,
            started_at,
            completed_at:  Utc::now(),
        }
    }

    pub fn failed(
        execution_id: impl Into<String>,
        code: ErrorCode,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let error = error.into();
        let status = match code {
            ErrorCode::Timeout => ExecutionStatus::TimedOut,
            ErrorCode::Cancelled => ExecutionStatus::Cancelled,
            _ => ExecutionStatus::Failed,
        };
        Self {
            execution_id:  execution_id.into(),
            step_id:       None,
            status,
            success:       false,
            message:       error.clone(),
            result:        None,
            error_code:    Some(code),
            error_message: Some(error),
            started_at,
            completed_at:  Utc::now(),
        }
    }

    pub fn with_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

/// A validated DAG lowered from a workflow definition.
///
/// Invariant: `dependencies` forms a DAG and every id it mentions appears
/// in `steps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub plan_id:         String,
    pub workflow_id:     String,
    pub steps:           Vec<PlanStep>,
    pub dependencies:    HashMap<String, Vec<String>>,
    pub parallel_groups: Vec<Vec<String>>,
    pub execution_mode:  ExecutionMode,
    pub optimized:       bool,
    pub validated:       bool,
    pub created_by:      String,
}

impl ExecutionPlan {
    pub fn new(workflow_id: impl Into<String>, steps: Vec<PlanStep>, created_by: &str) -> Self {
        Self {
            plan_id:         uuid::Uuid::new_v4().to_string(),
            workflow_id:     workflow_id.into(),
            steps,
            dependencies:    HashMap::new(),
            parallel_groups: Vec::new(),
            execution_mode:  ExecutionMode::Sequential,
            optimized:       false,
            validated:       false,
            created_by:      created_by.to_string(),
        }
    }
}

/// One schedulable step in an [`ExecutionPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id:    String,
    pub definition: Value,
    /// Named mutexes this step must hold while running, in acquisition order.
    #[serde(default)]
    pub resources:  Vec<String>,
}

impl PlanStep {
    pub fn new(step_id: impl Into<String>, definition: Value) -> Self {
        Self {
            step_id:    step_id.into(),
            definition,
            resources:  Vec::new(),
        }
    }

    pub fn with_resources(mut self, resources: Vec<String>) -> Self {
        self.resources = resources;
        self
    }
}

/// A tool invocation requested by the LLM or queued by an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id:         Option<String>,
    pub name:       String,
    pub operation:  Option<String>,
    pub arguments:  Value,
    /// Explicit dependencies on earlier calls in the same batch (by index).
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id:         None,
            name:       name.into(),
            operation:  None,
            arguments,
            depends_on: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_depends_on(mut self, indices: Vec<usize>) -> Self {
        self.depends_on = indices;
        self
    }
}

/// Tracks token usage for a single LLM call or an entire session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens:  u32,
    pub output_tokens: u32,
    pub total_tokens:  u32,
}

impl TokenUsage {
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input_tokens:  input,
            output_tokens: output,
            total_tokens:  input + output,
        }
    }

    /// Accumulate usage from another call.
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::TimedOut.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Paused.is_terminal());
    }

    #[test]
    fn direct_task_shape() {
        let task = Task::direct("calculator", "add", serde_json::json!({"a": 1, "b": 2}));
        assert!(task.is_direct());
        assert_eq!(task.description, "calculator.add");
    }

    #[test]
    fn failed_result_maps_timeout_status() {
        let r = ExecutionResult::failed("e1", ErrorCode::Timeout, "too slow", Utc::now());
        assert_eq!(r.status, ExecutionStatus::TimedOut);
        assert!(!r.success);
        assert_eq!(r.error_code, Some(ErrorCode::Timeout));
    }

    #[test]
    fn token_usage_accumulates() {
        let mut usage = TokenUsage::new(10, 5);
        usage.add(TokenUsage::new(3, 2));
        assert_eq!(usage.total_tokens, 20);
    }
}
