//! A declarative workflow: sequence, template references, a conditional
//! branch and a parallel block, executed end to end.
//!
//! Run with: `cargo run --example dsl_workflow`

use agentexec::cancel::CancelToken;
use agentexec::dsl::DslEngine;
use agentexec::tools::builtin::{CalculatorTool, TextTool};
use agentexec::tools::{ToolExecutor, ToolRegistry};
use agentexec::types::ExecutionContext;
use anyhow::Result;
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(CalculatorTool::new()));
    registry.register(Arc::new(TextTool::new()));
    let engine = DslEngine::new(Arc::new(ToolExecutor::new(registry)));

    let workflow = json!([
        {"task": "base", "tools": ["calculator.add"], "parameters": {"a": 20, "b": 22}},
        {"if": "result.task_2 >= 42",
         "then": [{"task": "celebrate", "tools": ["text.uppercase"],
                   "parameters": {"text": "the answer is ${result.task_2}"}}],
         "else": [{"task": "shrink", "tools": ["calculator.divide"],
                   "parameters": {"a": "${result.task_2}", "b": 2}}]},
        {"parallel": [
            {"task": "double", "tools": ["calculator.multiply"],
             "parameters": {"a": "${result.task_2}", "b": 2}},
            {"task": "halve", "tools": ["calculator.divide"],
             "parameters": {"a": "${result.task_2}", "b": 2}}
        ], "max_concurrency": 2}
    ]);

    let ctx = ExecutionContext::new(json!({"origin": "demo"}));
    let outcome = engine.run(&workflow, ctx, CancelToken::new()).await;

    println!("workflow success: {}", outcome.success);
    for result in &outcome.results {
        println!(
            "  {:<8} {} -> {}",
            result.step_id.as_deref().unwrap_or("?"),
            result.status,
            result
                .result
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".into())
        );
    }
    if let Some(plan) = &outcome.plan {
        println!("plan {} covered {} steps", plan.plan_id, plan.steps.len());
    }

    Ok(())
}
