//! Declarative workflow language: parser, validator and execution engine.
//!
//! A workflow is a JSON document of nested steps (`task`, `parallel`, `if`,
//! `sequence`, `loop`, `wait`). The parser lowers it to a typed node tree,
//! the validator checks dependencies, cycles, resources and cost, and the
//! engine drives the tree through the tool substrate.

pub mod engine;
pub mod expr;
pub mod node;
pub mod parser;
pub mod validator;

pub use engine::{DslEngine, DslRunOutcome, TaskHandler};
pub use node::{
    ConditionNodeConfig, ConditionType, DslNode, LoopNodeConfig, NodeKind, ParallelNodeConfig,
    TaskNodeConfig, WaitNodeConfig,
};
pub use parser::{DslParseResult, DslParser, ParseMetadata};
pub use validator::{
    DslValidator, TaskInfo, ValidationIssue, ValidationResult, ValidationSeverity,
};
