use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured record of one tool invocation.
///
/// Produced once per invocation — cache hits included — and appended to the
/// agent's execution trace. The timestamp is wall-clock UTC, captured at
/// construction; the duration must be measured with a monotonic clock by
/// the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolObservation {
    pub tool_name:         String,
    pub parameters:        Value,
    pub result:            Option<Value>,
    pub success:           bool,
    pub error:             Option<String>,
    pub execution_time_ms: f64,
    pub timestamp:         DateTime<Utc>,
}

impl ToolObservation {
    pub fn success(tool_name: impl Into<String>, parameters: Value, result: Value, execution_time_ms: f64) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            result: Some(result),
            success: true,
            error: None,
            execution_time_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(tool_name: impl Into<String>, parameters: Value, error: impl Into<String>, execution_time_ms: f64) -> Self {
        Self {
            tool_name: tool_name.into(),
            parameters,
            result: None,
            success: false,
            error: Some(error.into()),
            execution_time_ms,
            timestamp: Utc::now(),
        }
    }

    /// Round-trip-safe map of all fields.
    pub fn to_map(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Short human-readable block, suitable for feeding back to an LLM.
    pub fn as_text(&self) -> String {
        let status = if self.success { "SUCCESS" } else { "FAILURE" };
        let body = if self.success {
            self.result
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "null".to_string())
        } else {
            self.error.clone().unwrap_or_else(|| "unknown error".to_string())
        };
        format!(
            "Tool: {}\nParameters: {}\nStatus: {}\nResult: {}\nTime: {:.2}ms",
            self.tool_name, self.parameters, status, body, self.execution_time_ms
        )
    }
}

impl std::fmt::Display for ToolObservation {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_round_trips() {
        let obs = ToolObservation::success("calculator", json!({"a": 1}), json!(3), 12.5);
        let map = obs.to_map();
        let back: ToolObservation = serde_json::from_value(map).unwrap();
        assert_eq!(back.tool_name, "calculator");
        assert_eq!(back.result, Some(json!(3)));
        assert!(back.success);
        assert_eq!(back.execution_time_ms, 12.5);
    }

    #[test]
    fn text_block_format() {
        let obs = ToolObservation::success("calculator", json!({"a": 1, "b": 2}), json!(3), 1.237);
        let text = obs.as_text();
        assert!(text.starts_with("Tool: calculator\n"));
        assert!(text.contains("Status: SUCCESS"));
        assert!(text.contains("Result: 3"));
        assert!(text.ends_with("Time: 1.24ms"));
    }

    #[test]
    fn failure_shows_error() {
        let obs = ToolObservation::failure("web", json!({}), "connection refused", 5.0);
        let text = obs.as_text();
        assert!(text.contains("Status: FAILURE"));
        assert!(text.contains("connection refused"));
    }
}
