use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded event in an agent's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub step:      usize,
    pub scope:     String,
    pub event:     String,
    pub data:      String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only event log kept by every agent.
///
/// Every task turn, tool invocation, recovery attempt and lifecycle edge is
/// recorded here alongside the structured tracing output.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ExecutionTrace {
    entries: Vec<TraceEntry>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn record(&mut self, step: usize, scope: &str, event: &str, data: &str) {
        tracing::debug!(scope, event, data, step, "agent trace");
        self.entries.push(TraceEntry {
            step,
            scope:     scope.to_string(),
            event:     event.to_string(),
            data:      data.to_string(),
            timestamp: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries recorded under a given scope (e.g. "tool", "recovery").
    pub fn for_scope(&self, scope: &str) -> Vec<&TraceEntry> {
        self.entries.iter().filter(|e| e.scope == scope).collect()
    }

    pub fn for_event(&self, event: &str) -> Vec<&TraceEntry> {
        self.entries.iter().filter(|e| e.event == event).collect()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(&self.entries).unwrap_or_else(|_| "[]".to_string())
    }
}
