//! Hybrid agent execution core.
//!
//! Three tightly coupled subsystems behind one crate:
//!
//! - **Tool substrate** ([`tools`]): registry, schema validation, caching,
//!   rate limiting and observed dispatch of tool operations.
//! - **Workflow engine** ([`dsl`]): a declarative task language parsed into
//!   typed trees, validated (dependencies, cycles, resources, cost) and
//!   executed with sequence/parallel/condition/loop/wait semantics, plus
//!   the dependency-aware batch scheduler in [`parallel`].
//! - **Agents** ([`agent`]): lifecycle machinery shared by the tool, LLM
//!   and hybrid agents; the hybrid agent adds cached parallel tool
//!   execution, context pruning, learning, collaboration and recovery.
//!
//! External collaborators — LLM providers, durable context, checkpoints —
//! are consumed through the narrow traits in [`llm`], [`context_engine`]
//! and [`checkpoint`].

pub mod agent;
pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod context_engine;
pub mod dsl;
pub mod error;
pub mod llm;
pub mod parallel;
pub mod tools;
pub mod types;

// Convenience re-exports at crate root
pub use agent::{
    AgentEvent, AgentLifecycle, AgentRegistry, CollaborationStrategy, Collaborator, HybridAgent,
    HybridAgentBuilder, LlmAgent, RecoveryStrategy, TaskOutcome, ToolAgent,
};
pub use cancel::CancelToken;
pub use checkpoint::{Checkpointer, FileCheckpointer, MemoryCheckpointer, SqliteCheckpointer};
pub use config::CoreConfig;
pub use context_engine::{ContextEngine, InMemoryContextEngine};
pub use dsl::{DslEngine, DslParser, DslValidator};
pub use error::{CoreError, CoreResult, ErrorCode};
pub use llm::{LlmClient, MockLlmClient, RetryingLlmClient};
pub use parallel::ParallelEngine;
pub use tools::{Tool, ToolExecutor, ToolObservation, ToolRegistry};
pub use types::{ExecutionContext, ExecutionPlan, ExecutionResult, ExecutionStatus, Task};
