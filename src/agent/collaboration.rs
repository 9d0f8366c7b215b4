use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::TaskOutcome;
use crate::error::{CoreError, CoreResult};
use crate::types::{ExecutionContext, Task};

/// Verdict returned by a peer review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerReview {
    pub approved:    bool,
    pub feedback:    String,
    pub reviewer_id: String,
}

/// Fan-out strategy for [`collaborate`]-style execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaborationStrategy {
    Parallel,
    Sequential,
    Consensus,
}

/// What one agent exposes to its peers.
///
/// Peers are always addressed by id through an [`AgentRegistry`] — agents
/// never hold direct references to each other.
#[async_trait]
pub trait Collaborator: Send + Sync {
    fn agent_id(&self) -> &str;

    fn capabilities(&self) -> Vec<String>;

    async fn handle_task(&self, task: Task, ctx: ExecutionContext) -> CoreResult<TaskOutcome>;

    /// Review another agent's result for a task.
    async fn review(&self, task: &Task, result: &Value) -> CoreResult<PeerReview>;
}

/// Registry of collaborating agents, keyed by agent id.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Collaborator>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, agent: Arc<dyn Collaborator>) {
        let id = agent.agent_id().to_string();
        tracing::debug!(agent = %id, "registering collaborator");
        self.agents.write().expect("registry lock poisoned").insert(id, agent);
    }

    pub fn unregister(&self, agent_id: &str) -> bool {
        self.agents
            .write()
            .expect("registry lock poisoned")
            .remove(agent_id)
            .is_some()
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<dyn Collaborator>> {
        self.agents
            .read()
            .expect("registry lock poisoned")
            .get(agent_id)
            .cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of agents whose declared capabilities cover every requested one.
    pub fn find_capable(&self, capabilities: &[String]) -> Vec<String> {
        let agents = self.agents.read().expect("registry lock poisoned");
        let mut ids: Vec<String> = agents
            .values()
            .filter(|agent| {
                let declared = agent.capabilities();
                capabilities.iter().all(|needed| declared.contains(needed))
            })
            .map(|agent| agent.agent_id().to_string())
            .collect();
        ids.sort();
        ids
    }

    /// Resolve a peer or fail with a validation error naming it.
    pub fn require(&self, agent_id: &str) -> CoreResult<Arc<dyn Collaborator>> {
        self.get(agent_id).ok_or_else(|| {
            CoreError::Validation(format!("agent '{}' is not registered", agent_id))
        })
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StubAgent;
    use super::*;

    #[test]
    fn register_and_resolve() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(StubAgent::ok("peer-1", &["research"])));
        assert!(registry.get("peer-1").is_some());
        assert!(registry.get("peer-2").is_none());
        assert!(registry.require("peer-2").is_err());
        assert!(registry.unregister("peer-1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn find_capable_requires_all_capabilities() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(StubAgent::ok("a", &["research", "write"])));
        registry.register(Arc::new(StubAgent::ok("b", &["research"])));

        let both = registry.find_capable(&["research".to_string(), "write".to_string()]);
        assert_eq!(both, vec!["a".to_string()]);

        let research = registry.find_capable(&["research".to_string()]);
        assert_eq!(research, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn stub_round_trip() {
        let registry = AgentRegistry::new();
        registry.register(Arc::new(StubAgent::ok("peer", &[])));
        let peer = registry.require("peer").unwrap();
        let outcome = peer
            .handle_task(Task::new("summarize"), ExecutionContext::default())
            .await
            .unwrap();
        assert!(outcome.success);
    }
}
