pub mod builtin;
pub mod cache;
pub mod executor;
pub mod observation;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use cache::{CacheStats, ToolCache};
pub use executor::{InvokeOptions, ToolExecutor, TtlStrategy};
pub use observation::ToolObservation;
pub use registry::ToolRegistry;

/// Declared shape of a single parameter of a tool operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub param_type:  String,
    pub required:    bool,
    pub description: String,
    #[serde(default)]
    pub examples:    Vec<Value>,
}

impl ParamSpec {
    pub fn new(param_type: &str, required: bool, description: &str) -> Self {
        Self {
            param_type:  param_type.to_string(),
            required,
            description: description.to_string(),
            examples:    Vec::new(),
        }
    }
}

/// Static description of one tool operation, emitted by the build-time
/// catalog and convertible to an LLM function-calling schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSchema {
    pub description: String,
    pub parameters:  BTreeMap<String, ParamSpec>,
    #[serde(default)]
    pub examples:    Vec<Value>,
}

impl OperationSchema {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            parameters:  BTreeMap::new(),
            examples:    Vec::new(),
        }
    }

    pub fn param(mut self, name: &str, spec: ParamSpec) -> Self {
        self.parameters.insert(name.to_string(), spec);
        self
    }

    /// JSON Schema object suitable for the `parameters` field of an LLM
    /// function definition.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.parameters {
            properties.insert(
                name.clone(),
                serde_json::json!({
                    "type": spec.param_type,
                    "description": spec.description,
                }),
            );
            if spec.required {
                required.push(Value::String(name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check `params` against the declared specs. Returns a remediation
    /// message on the first violation.
    pub fn check_params(&self, params: &Value) -> Result<(), String> {
        let obj = match params {
            Value::Object(map) => map,
            Value::Null => {
                if self.parameters.values().any(|s| s.required) {
                    return Err("parameters object is required".to_string());
                }
                return Ok(());
            }
            other => {
                return Err(format!(
                    "parameters must be a JSON object, got {}",
                    json_type_name(other)
                ))
            }
        };

        for (name, spec) in &self.parameters {
            match obj.get(name) {
                None if spec.required => {
                    return Err(format!(
                        "missing required parameter '{}' ({}): {}",
                        name, spec.param_type, spec.description
                    ));
                }
                Some(value) if !type_matches(&spec.param_type, value) => {
                    return Err(format!(
                        "parameter '{}' must be of type {}, got {}",
                        name,
                        spec.param_type,
                        json_type_name(value)
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

/// The capability every tool exposes to the execution core.
///
/// Implementations must be cheap to share behind `Arc<dyn Tool>`; `run` is
/// the only suspension point.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn supported_operations(&self) -> Vec<String>;

    /// Validate parameters before dispatch. The error string is shown to
    /// callers as remediation.
    fn validate_params(&self, operation: &str, params: &Value) -> Result<(), String>;

    async fn run(&self, operation: &str, params: &Value) -> Result<Value, String>;

    fn operation_schema(&self, _operation: &str) -> Option<OperationSchema> {
        None
    }

    /// Operation assumed when an LLM function call names only the tool.
    fn default_operation(&self) -> Option<String> {
        self.supported_operations().first().cloned()
    }
}

type OperationFn = Arc<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

/// One named operation of an [`FnTool`].
pub struct FnOperation {
    name:    String,
    schema:  OperationSchema,
    handler: OperationFn,
}

impl FnOperation {
    pub fn new<F>(name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name:    name.to_string(),
            schema:  OperationSchema::new(description),
            handler: Arc::new(handler),
        }
    }

    pub fn param(mut self, name: &str, param_type: &str, description: &str) -> Self {
        self.schema
            .parameters
            .insert(name.to_string(), ParamSpec::new(param_type, true, description));
        self
    }

    pub fn optional_param(mut self, name: &str, param_type: &str, description: &str) -> Self {
        self.schema
            .parameters
            .insert(name.to_string(), ParamSpec::new(param_type, false, description));
        self
    }
}

/// Reflective fallback for ad-hoc tools built from closures.
///
/// The preferred path is a static [`Tool`] implementation with a full
/// operation catalog; `FnTool` exists for tests, demos and one-off glue.
pub struct FnTool {
    name:        String,
    description: String,
    operations:  Vec<FnOperation>,
}

impl FnTool {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name:        name.to_string(),
            description: description.to_string(),
            operations:  Vec::new(),
        }
    }

    pub fn operation(mut self, op: FnOperation) -> Self {
        self.operations.push(op);
        self
    }

    fn find(&self, operation: &str) -> Option<&FnOperation> {
        self.operations.iter().find(|op| op.name == operation)
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn supported_operations(&self) -> Vec<String> {
        self.operations.iter().map(|op| op.name.clone()).collect()
    }

    fn validate_params(&self, operation: &str, params: &Value) -> Result<(), String> {
        match self.find(operation) {
            Some(op) => op.schema.check_params(params),
            None => Err(format!("unknown operation '{}'", operation)),
        }
    }

    async fn run(&self, operation: &str, params: &Value) -> Result<Value, String> {
        let op = self
            .find(operation)
            .ok_or_else(|| format!("unknown operation '{}'", operation))?;
        (op.handler)(params)
    }

    fn operation_schema(&self, operation: &str) -> Option<OperationSchema> {
        self.find(operation).map(|op| op.schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_tool() -> FnTool {
        FnTool::new("echo", "Echoes its input").operation(
            FnOperation::new("say", "Return the given text", |params| {
                Ok(params.get("text").cloned().unwrap_or(Value::Null))
            })
            .param("text", "string", "Text to echo"),
        )
    }

    #[tokio::test]
    async fn fn_tool_runs_operation() {
        let tool = echo_tool();
        let out = tool.run("say", &json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[test]
    fn validate_rejects_missing_required() {
        let tool = echo_tool();
        let err = tool.validate_params("say", &json!({})).unwrap_err();
        assert!(err.contains("missing required parameter 'text'"));
    }

    #[test]
    fn validate_rejects_wrong_type() {
        let tool = echo_tool();
        let err = tool.validate_params("say", &json!({"text": 42})).unwrap_err();
        assert!(err.contains("must be of type string"));
    }

    #[test]
    fn schema_lists_required_params() {
        let tool = echo_tool();
        let schema = tool.operation_schema("say").unwrap().to_json_schema();
        assert_eq!(schema["required"], json!(["text"]));
    }
}
