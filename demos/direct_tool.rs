//! Direct tool dispatch through the executor: validation, caching, rate
//! limiting — no LLM involved.
//!
//! Run with: `cargo run --example direct_tool`

use agentexec::tools::builtin::{CalculatorTool, TextTool};
use agentexec::tools::{InvokeOptions, ToolExecutor, ToolRegistry};
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
    let executor = ToolExecutor::new(registry);

    let sum = executor
        .invoke(
            "calculator",
            "add",
            json!({"a": 5, "b": 3}),
            InvokeOptions::default(),
        )
        .await?;
    println!("calculator.add(5, 3) = {}", sum);

    // Same canonical parameters: this one is a cache hit.
    let again = executor
        .invoke(
            "calculator",
            "add",
            json!({"b": 3, "a": 5}),
            InvokeOptions::default(),
        )
        .await?;
    println!("cached: {}", again);
    println!("cache stats: {:?}", executor.cache().stats());

    let shout = executor
        .invoke(
            "text",
            "uppercase",
            json!({"text": "tool substrate online"}),
            InvokeOptions::default(),
        )
        .await?;
    println!("text.uppercase = {}", shout);

    // Validation failures carry remediation, not panics.
    let err = executor
        .invoke("calculator", "add", json!({"a": 5}), InvokeOptions::default())
        .await
        .unwrap_err();
    println!("expected validation failure: {}", err);

    Ok(())
}
