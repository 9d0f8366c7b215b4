//! The hybrid loop with a scripted model: streaming tokens, function
//! calls, cached parallel tool execution and observations — no network.
//!
//! Run with: `cargo run --example hybrid_loop`

use agentexec::agent::{AgentEvent, HybridAgentBuilder};
use agentexec::llm::{LlmReply, LlmToolCall, MockLlmClient};
use agentexec::tools::builtin::CalculatorTool;
use agentexec::types::{ExecutionContext, Task};
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

    // Two scripted turns: the model asks for two calculator calls, then
    // summarizes their results.
    let turn1 = LlmReply::text("I will compute both values. ").with_tool_calls(vec![
        LlmToolCall::new("c1", "calculator.add", r#"{"a":19,"b":23}"#),
        LlmToolCall::new("c2", "calculator.multiply", r#"{"a":6,"b":7}"#),
    ]);
    let turn2 = LlmReply::text("Both paths agree: the answer is 42.");

    let agent = HybridAgentBuilder::new("demo-hybrid")
        .llm(Arc::new(MockLlmClient::new(vec![turn1, turn2])))
        .retry_on_error(2)
        .tool(Arc::new(CalculatorTool::new()))
        .system_prompt("You are a careful analyst; verify results two ways.")
        .build()?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Token { token } => print!("{}", token),
                AgentEvent::ToolCalls { count } => println!("\n[model requested {} tools]", count),
                AgentEvent::ToolCall { name, arguments } => {
                    println!("[call] {} {}", name, arguments)
                }
                AgentEvent::ToolResult { name, success, result } => {
                    println!("[done] {} success={} result={}", name, success, result)
                }
                AgentEvent::Result { success, payload } => {
                    println!("\n[final] success={} payload={}", success, payload)
                }
                other => println!("[{}]", other.type_name()),
            }
        }
    });

    let task = Task::new("compute 19+23 and 6*7, then compare").with_task_type("calculation");
    let outcome = agent
        .execute_task_streaming(&task, &ExecutionContext::default(), tx)
        .await?;
    printer.await?;

    println!("tool calls: {}", outcome.tool_calls_count);
    for observation in &outcome.observations {
        println!("--\n{}", observation.as_text());
    }
    println!("cache stats after the run: {:?}", agent.cache_stats());
    println!(
        "recommended approach for 'calculation': {:?}",
        agent.recommended_approach("calculation")
    );

    Ok(())
}
