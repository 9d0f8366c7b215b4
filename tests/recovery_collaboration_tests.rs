//! Recovery chains and multi-agent collaboration.

use agentexec::agent::{
    AgentRegistry, CollaborationStrategy, Collaborator, HybridAgentBuilder, RecoveryStrategy,
    TaskOutcome,
};
use agentexec::error::{CoreError, CoreResult};
use agentexec::llm::{LlmReply, MockLlmClient};
use agentexec::tools::builtin::CalculatorTool;
use agentexec::types::{ExecutionContext, Task};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

struct ScriptedPeer {
    id:      String,
    caps:    Vec<String>,
    succeed: bool,
}

#[async_trait]
impl Collaborator for ScriptedPeer {
    fn agent_id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> Vec<String> {
        self.caps.clone()
    }

    async fn handle_task(&self, task: Task, _ctx: ExecutionContext) -> CoreResult<TaskOutcome> {
        if !self.succeed {
            return Err(CoreError::Execution(format!("{} declined", self.id)));
        }
        Ok(TaskOutcome::from_output(json!(format!(
            "{}:{}",
            self.id, task.description
        ))))
    }

    async fn review(
        &self,
        _task: &Task,
        result: &Value,
    ) -> CoreResult<agentexec::agent::PeerReview> {
        Ok(agentexec::agent::PeerReview {
            approved:    !result.is_null(),
            feedback:    "fine".to_string(),
            reviewer_id: self.id.clone(),
        })
    }
}

fn peer(id: &str, caps: &[&str], succeed: bool) -> Arc<ScriptedPeer> {
    Arc::new(ScriptedPeer {
        id:      id.to_string(),
        caps:    caps.iter().map(|s| s.to_string()).collect(),
        succeed,
    })
}

#[tokio::test]
async fn delegation_recovers_a_failing_task() {
    let agent = HybridAgentBuilder::new("lead")
        .tool(Arc::new(CalculatorTool::new()))
        .learning(false)
        .build()
        .unwrap();

    let registry = AgentRegistry::new();
    registry.register(peer("helper", &["math"], true));

    let task = Task::direct("calculator", "divide", json!({"a": 1, "b": 0}))
        .with_task_type("math");
    let outcome = agent
        .execute_with_recovery(
            &task,
            &ExecutionContext::default(),
            &RecoveryStrategy::all(),
            Some(&registry),
        )
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.recovery_strategy.as_deref(), Some("delegate"));
}

#[tokio::test]
async fn retry_recovers_transient_llm_failures() {
    // First turn errors transiently, second turn answers.
    struct Flaky {
        inner: MockLlmClient,
        failed_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl agentexec::llm::LlmClient for Flaky {
        async fn generate_text(
            &self,
            messages: &[agentexec::llm::ChatMessage],
            opts: &agentexec::llm::LlmOptions,
        ) -> Result<LlmReply, agentexec::llm::LlmError> {
            if !self.failed_once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(agentexec::llm::LlmError::transient("503 from provider"));
            }
            self.inner.generate_text(messages, opts).await
        }

        fn stream_text<'a>(
            &'a self,
            messages: &'a [agentexec::llm::ChatMessage],
            opts: &'a agentexec::llm::LlmOptions,
        ) -> futures::stream::BoxStream<'a, Result<agentexec::llm::StreamChunk, agentexec::llm::LlmError>>
        {
            self.inner.stream_text(messages, opts)
        }

        fn provider(&self) -> &str {
            "flaky"
        }
    }

    let agent = HybridAgentBuilder::new("retrier")
        .llm(Arc::new(Flaky {
            inner: MockLlmClient::new(vec![LlmReply::text("recovered answer")]),
            failed_once: std::sync::atomic::AtomicBool::new(false),
        }))
        .learning(false)
        .build()
        .unwrap();

    let outcome = agent
        .execute_with_recovery(
            &Task::new("answer me").with_max_retries(2),
            &ExecutionContext::default(),
            &[RecoveryStrategy::Retry],
            None,
        )
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.recovery_strategy.as_deref(), Some("retry"));
    assert_eq!(outcome.output, Some(json!("recovered answer")));
}

#[tokio::test]
async fn fallback_runs_when_configured() {
    let agent = HybridAgentBuilder::new("faller")
        .tool(Arc::new(CalculatorTool::new()))
        .learning(false)
        .fallback(Arc::new(|task| {
            Box::pin(async move {
                Ok(TaskOutcome::from_output(json!(format!(
                    "fallback handled {}",
                    task.description
                ))))
            })
        }))
        .build()
        .unwrap();

    let task = Task::direct("calculator", "divide", json!({"a": 1, "b": 0}));
    let outcome = agent
        .execute_with_recovery(
            &task,
            &ExecutionContext::default(),
            &[RecoveryStrategy::Fallback],
            None,
        )
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.recovery_strategy.as_deref(), Some("fallback"));
}

#[tokio::test]
async fn parallel_collaboration_collects_every_peer() {
    let agent = HybridAgentBuilder::new("lead").build().unwrap();
    let registry = AgentRegistry::new();
    registry.register(peer("p1", &[], true));
    registry.register(peer("p2", &[], true));
    registry.register(peer("p3", &[], false));

    let result = agent
        .collaborate_on_task(
            &registry,
            &Task::new("scatter"),
            &["p1".into(), "p2".into(), "p3".into()],
            CollaborationStrategy::Parallel,
        )
        .await
        .unwrap();

    let results = result["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(
        results.iter().filter(|r| r["success"] == json!(true)).count(),
        2
    );
}

#[tokio::test]
async fn consensus_requires_a_majority() {
    let agent = HybridAgentBuilder::new("lead").build().unwrap();
    let registry = AgentRegistry::new();
    registry.register(peer("p1", &[], true));
    registry.register(peer("p2", &[], false));
    registry.register(peer("p3", &[], false));

    let result = agent
        .collaborate_on_task(
            &registry,
            &Task::new("vote"),
            &["p1".into(), "p2".into(), "p3".into()],
            CollaborationStrategy::Consensus,
        )
        .await
        .unwrap();
    assert_eq!(result["agreed"], json!(false));
    assert_eq!(result["votes"], json!(1));
}

#[tokio::test]
async fn peer_review_round_trip() {
    let agent = HybridAgentBuilder::new("author").build().unwrap();
    let registry = AgentRegistry::new();
    registry.register(peer("reviewer", &[], true));

    let review = agent
        .request_peer_review(&registry, &Task::new("draft"), &json!("content"), "reviewer")
        .await
        .unwrap();
    assert!(review.approved);
    assert_eq!(review.reviewer_id, "reviewer");
}

#[tokio::test]
async fn capable_agent_discovery_excludes_self() {
    let lead = HybridAgentBuilder::new("lead").capability("math").build().unwrap();
    let registry = AgentRegistry::new();
    registry.register(peer("m1", &["math"], true));
    registry.register(peer("w1", &["writing"], true));

    let found = lead.find_capable_agents(&registry, &["math".to_string()]);
    assert_eq!(found, vec!["m1".to_string()]);
}
