use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::Tool;
use crate::llm::FunctionSchema;

/// Process-wide tool catalog, built once at startup.
///
/// Lookup is by tool name; function-calling schemas are derived one per
/// operation, named `<tool>.<operation>`.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "registering tool");
        self.tools.write().expect("registry lock poisoned").insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.read().expect("registry lock poisoned").contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// All `<tool>.<operation>` pairs, used by the DSL validator's tool
    /// catalog check.
    pub fn operation_names(&self) -> Vec<String> {
        let tools = self.tools.read().expect("registry lock poisoned");
        let mut out = Vec::new();
        for tool in tools.values() {
            for op in tool.supported_operations() {
                out.push(format!("{}.{}", tool.name(), op));
            }
        }
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.tools.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Function-calling schemas for every registered operation — the tools
    /// array attached to each LLM call.
    pub fn function_schemas(&self) -> Vec<FunctionSchema> {
        let tools = self.tools.read().expect("registry lock poisoned");
        let mut schemas = Vec::new();
        for tool in tools.values() {
            for op in tool.supported_operations() {
                let (description, parameters) = match tool.operation_schema(&op) {
                    Some(schema) => (schema.description.clone(), schema.to_json_schema()),
                    None => (
                        format!("{} ({})", tool.description(), op),
                        serde_json::json!({"type": "object", "properties": {}}),
                    ),
                };
                schemas.push(FunctionSchema {
                    name: format!("{}.{}", tool.name(), op),
                    description,
                    parameters,
                });
            }
        }
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Map an LLM function-call name back to a tool and operation.
    ///
    /// Accepts `<tool>.<operation>` and the bare `<tool>` form (some models
    /// drop the suffix), which resolves to the tool's default operation.
    pub fn resolve_function(&self, name: &str) -> Option<(Arc<dyn Tool>, String)> {
        if let Some((tool_name, op)) = name.split_once('.') {
            if let Some(tool) = self.get(tool_name) {
                if tool.supported_operations().iter().any(|o| o == op) {
                    return Some((tool, op.to_string()));
                }
            }
        }
        let tool = self.get(name)?;
        let op = tool.default_operation()?;
        Some((tool, op))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
