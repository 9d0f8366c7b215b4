//! Agents: shared lifecycle machinery plus the tool, LLM and hybrid
//! execution loops layered on top of it.

pub mod builder;
pub mod collaboration;
pub mod context;
pub mod core;
pub mod events;
pub mod learning;
pub mod lifecycle;
pub mod llm_agent;
pub mod recovery;
pub mod resources;
pub mod tool_agent;
pub mod trace;

mod hybrid;

pub use builder::HybridAgentBuilder;
pub use collaboration::{
    AgentRegistry, CollaborationStrategy, Collaborator, PeerReview,
};
pub use context::{score_relevance, ContextItem, ContextSelector, ScoredItem};
pub use core::{AgentCore, ExecutionRecord, HookContext, HookFn, HookKind, TaskGuard};
pub use events::AgentEvent;
pub use hybrid::{FallbackFn, HybridAgent, HybridConfig};
pub use learning::{
    Experience, LearningInsights, LearningStore, Recommendation, StrategyAdjustment,
};
pub use lifecycle::AgentLifecycle;
pub use llm_agent::LlmAgent;
pub use recovery::RecoveryStrategy;
pub use resources::{ResourceAvailability, ResourceMonitor, ResourceUsage, SlidingWindow};
pub use tool_agent::ToolAgent;
pub use trace::{ExecutionTrace, TraceEntry};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;

use crate::error::CoreResult;
use crate::tools::{InvokeOptions, ToolExecutor, ToolObservation};

/// Outcome of one agent task turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success:           bool,
    pub output:            Option<Value>,
    pub tool_calls_count:  usize,
    pub tool_results:      Vec<Value>,
    pub observations:      Vec<ToolObservation>,
    pub tool_used:         Option<String>,
    pub error:             Option<String>,
    /// Recovery strategy that produced this outcome, when one did.
    pub recovery_strategy: Option<String>,
}

impl TaskOutcome {
    pub fn from_output(output: Value) -> Self {
        Self {
            success:           true,
            output:            Some(output),
            tool_calls_count:  0,
            tool_results:      Vec::new(),
            observations:      Vec::new(),
            tool_used:         None,
            error:             None,
            recovery_strategy: None,
        }
    }
}

/// Invoke a tool through the executor, timing it with a monotonic clock and
/// capturing the outcome as a [`ToolObservation`].
pub(crate) async fn invoke_with_observation(
    executor: &ToolExecutor,
    tool_name: &str,
    operation: &str,
    params: &Value,
    opts: InvokeOptions,
) -> (ToolObservation, CoreResult<Value>) {
    let started = Instant::now();
    let outcome = executor
        .invoke(tool_name, operation, params.clone(), opts)
        .await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

    match outcome {
        Ok(value) => (
            ToolObservation::success(tool_name, params.clone(), value.clone(), elapsed_ms),
            Ok(value),
        ),
        Err(err) => {
            let observation =
                ToolObservation::failure(tool_name, params.clone(), err.to_string(), elapsed_ms);
            (observation, Err(err))
        }
    }
}

