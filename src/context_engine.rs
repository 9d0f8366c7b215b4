use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::CoreResult;

/// Durable key-value context shared between agent turns, scoped by session.
#[async_trait]
pub trait ContextEngine: Send + Sync {
    async fn initialize(&self) -> CoreResult<()>;

    async fn put(&self, session_id: &str, key: &str, value: Value) -> CoreResult<()>;

    async fn get(&self, session_id: &str, key: &str) -> CoreResult<Option<Value>>;

    async fn close(&self) -> CoreResult<()>;
}

/// In-memory engine for tests and single-process deployments.
pub struct InMemoryContextEngine {
    sessions: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryContextEngine {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn session_keys(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .expect("context lock poisoned")
            .get(session_id)
            .map(|session| {
                let mut keys: Vec<String> = session.keys().cloned().collect();
                keys.sort();
                keys
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryContextEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextEngine for InMemoryContextEngine {
    async fn initialize(&self) -> CoreResult<()> {
        Ok(())
    }

    async fn put(&self, session_id: &str, key: &str, value: Value) -> CoreResult<()> {
        self.sessions
            .lock()
            .expect("context lock poisoned")
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, session_id: &str, key: &str) -> CoreResult<Option<Value>> {
        Ok(self
            .sessions
            .lock()
            .expect("context lock poisoned")
            .get(session_id)
            .and_then(|session| session.get(key).cloned()))
    }

    async fn close(&self) -> CoreResult<()> {
        self.sessions.lock().expect("context lock poisoned").clear();
        Ok(())
    }
}
