use serde_json::Value;

use super::expr;
use super::node::{
    ConditionNodeConfig, ConditionType, DslNode, LoopNodeConfig, NodeKind, ParallelNodeConfig,
    TaskNodeConfig, WaitNodeConfig,
};

/// Counters describing a parsed tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseMetadata {
    pub node_count:      usize,
    pub max_depth:       usize,
    pub parallel_blocks: usize,
}

/// Outcome of a parse: either a tree, or accumulated errors. Never both
/// empty — an empty definition still yields a root sequence.
#[derive(Debug)]
pub struct DslParseResult {
    pub success:  bool,
    pub root:     Option<DslNode>,
    pub errors:   Vec<String>,
    pub warnings: Vec<String>,
    pub metadata: ParseMetadata,
}

/// Parser for the declarative workflow language.
///
/// Recognized step discriminators, in search order:
/// `task | parallel | if | sequence | loop | wait`. Node ids are
/// `<prefix>_<n>` from a monotonic counter, unique across the tree.
pub struct DslParser {
    counter:          u32,
    default_loop_cap: u32,
}

impl DslParser {
    pub fn new() -> Self {
        Self {
            counter:          0,
            default_loop_cap: 100,
        }
    }

    pub fn with_default_loop_cap(mut self, cap: u32) -> Self {
        self.default_loop_cap = cap;
        self
    }

    pub fn parse(&mut self, definition: &Value) -> DslParseResult {
        self.counter = 0;
        let mut errors = Vec::new();
        let warnings = Vec::new();

        let steps: Vec<Value> = match definition {
            Value::Array(items) => items.clone(),
            Value::Object(_) => vec![definition.clone()],
            _ => {
                errors.push("workflow definition must be an object or an array".to_string());
                return DslParseResult {
                    success: false,
                    root: None,
                    errors,
                    warnings,
                    metadata: ParseMetadata::default(),
                };
            }
        };

        let root = self.parse_sequence(&steps, &mut errors);
        self.validate_tree(&root, &mut errors);

        let metadata = ParseMetadata {
            node_count:      root.node_count(),
            max_depth:       root.max_depth(),
            parallel_blocks: root.parallel_block_count(),
        };

        let success = errors.is_empty();
        if !success {
            tracing::debug!(error_count = errors.len(), "workflow parse failed");
        }
        DslParseResult {
            success,
            root: Some(root),
            errors,
            warnings,
            metadata,
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_{}", prefix, self.counter)
    }

    fn parse_sequence(&mut self, steps: &[Value], errors: &mut Vec<String>) -> DslNode {
        let mut node = DslNode::new(self.next_id("seq"), NodeKind::Sequence);
        for step in steps {
            if let Some(child) = self.parse_step(step, errors) {
                node.children.push(child);
            }
        }
        node
    }

    fn parse_step(&mut self, step: &Value, errors: &mut Vec<String>) -> Option<DslNode> {
        let obj = match step.as_object() {
            Some(obj) => obj,
            None => {
                errors.push(format!("step must be an object, got: {}", step));
                return None;
            }
        };

        if obj.contains_key("task") {
            self.parse_task(step, errors)
        } else if obj.contains_key("parallel") {
            self.parse_parallel(step, errors)
        } else if obj.contains_key("if") {
            self.parse_condition(step, errors)
        } else if obj.contains_key("sequence") {
            match step["sequence"].as_array() {
                Some(steps) => Some(self.parse_sequence(steps, errors)),
                None => {
                    errors.push("'sequence' must be an array of steps".to_string());
                    None
                }
            }
        } else if obj.contains_key("loop") {
            self.parse_loop(step, errors)
        } else if obj.contains_key("wait") {
            self.parse_wait(step, errors)
        } else {
            let keys: Vec<&String> = obj.keys().collect();
            errors.push(format!("unknown step type, keys: {:?}", keys));
            None
        }
    }

    fn parse_task(&mut self, step: &Value, errors: &mut Vec<String>) -> Option<DslNode> {
        let task_name = match step["task"].as_str() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                errors.push("task step must have a non-empty 'task' string".to_string());
                return None;
            }
        };

        let tools = step
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let config = TaskNodeConfig {
            task_name,
            tools,
            parameters: step
                .get("parameters")
                .cloned()
                .unwrap_or_else(|| Value::Object(Default::default())),
            timeout:    step.get("timeout").and_then(Value::as_f64),
            retry_count: step
                .get("retry_count")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            conditions: step
                .get("conditions")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            depends_on: match step.get("depends_on") {
                Some(Value::String(name)) => vec![name.clone()],
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            },
            continue_on_failure: step
                .get("continue_on_failure")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        Some(DslNode::new(self.next_id("task"), NodeKind::Task(config)))
    }

    fn parse_parallel(&mut self, step: &Value, errors: &mut Vec<String>) -> Option<DslNode> {
        let tasks = match step["parallel"].as_array() {
            Some(tasks) if !tasks.is_empty() => tasks,
            _ => {
                errors.push("'parallel' must be a non-empty array of steps".to_string());
                return None;
            }
        };

        let config = ParallelNodeConfig {
            max_concurrency: step
                .get("max_concurrency")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(tasks.len()),
            wait_for_all: step
                .get("wait_for_all")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            fail_fast: step
                .get("fail_fast")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        let mut node = DslNode::new(self.next_id("par"), NodeKind::Parallel(config));
        for task in tasks {
            if let Some(child) = self.parse_step(task, errors) {
                node.children.push(child);
            }
        }
        Some(node)
    }

    fn parse_condition(&mut self, step: &Value, errors: &mut Vec<String>) -> Option<DslNode> {
        let condition = match step["if"].as_str() {
            Some(cond) if !cond.is_empty() => cond.to_string(),
            _ => {
                errors.push("conditional step must have a non-empty 'if' expression".to_string());
                return None;
            }
        };

        let config = ConditionNodeConfig {
            condition_type: classify_condition(&condition),
            condition,
        };
        let mut node = DslNode::new(self.next_id("cond"), NodeKind::Condition(config));

        for branch in ["then", "else"] {
            if let Some(steps) = step.get(branch).and_then(Value::as_array) {
                if steps.is_empty() {
                    continue;
                }
                let mut branch_node = self.parse_sequence(steps, errors);
                branch_node
                    .metadata
                    .insert("branch".to_string(), Value::String(branch.to_string()));
                node.children.push(branch_node);
            }
        }

        Some(node)
    }

    fn parse_loop(&mut self, step: &Value, errors: &mut Vec<String>) -> Option<DslNode> {
        let loop_config = match step["loop"].as_object() {
            Some(obj) => obj,
            None => {
                errors.push("'loop' must be an object with condition and body".to_string());
                return None;
            }
        };

        let condition = match loop_config.get("condition").and_then(Value::as_str) {
            Some(cond) if !cond.is_empty() => cond.to_string(),
            _ => {
                errors.push("loop must have a condition".to_string());
                return None;
            }
        };

        let body = loop_config
            .get("body")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if body.is_empty() {
            errors.push("loop body must not be empty".to_string());
            return None;
        }

        let config = LoopNodeConfig {
            condition,
            max_iterations: loop_config
                .get("max_iterations")
                .and_then(Value::as_u64)
                .map(|n| n as u32)
                .unwrap_or(self.default_loop_cap),
            break_on_error: loop_config
                .get("break_on_error")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        };

        let mut node = DslNode::new(self.next_id("loop"), NodeKind::Loop(config));
        let mut body_node = self.parse_sequence(&body, errors);
        body_node
            .metadata
            .insert("loop_body".to_string(), Value::Bool(true));
        node.children.push(body_node);
        Some(node)
    }

    fn parse_wait(&mut self, step: &Value, errors: &mut Vec<String>) -> Option<DslNode> {
        let wait_config = match step["wait"].as_object() {
            Some(obj) => obj,
            None => {
                errors.push("'wait' must be an object with a condition".to_string());
                return None;
            }
        };

        let condition = match wait_config.get("condition").and_then(Value::as_str) {
            Some(cond) if !cond.is_empty() => cond.to_string(),
            _ => {
                errors.push("wait must have a condition".to_string());
                return None;
            }
        };

        let config = WaitNodeConfig {
            condition,
            timeout: wait_config
                .get("timeout")
                .and_then(Value::as_f64)
                .unwrap_or(30.0),
            poll_interval: wait_config
                .get("poll_interval")
                .and_then(Value::as_f64)
                .unwrap_or(1.0),
        };

        Some(DslNode::new(self.next_id("wait"), NodeKind::Wait(config)))
    }

    /// Structural checks that don't need the task/tool catalogs (those live
    /// in the validator).
    fn validate_tree(&self, root: &DslNode, errors: &mut Vec<String>) {
        root.walk(&mut |node| match &node.kind {
            NodeKind::Condition(config) => {
                if let Err(err) = expr::check_syntax(&config.condition) {
                    errors.push(format!(
                        "invalid condition syntax in {}: {}",
                        node.node_id, err
                    ));
                }
                if node.children.len() > 2 {
                    errors.push(format!(
                        "condition {} has more than 2 branches",
                        node.node_id
                    ));
                }
            }
            NodeKind::Loop(config) => {
                if let Err(err) = expr::check_syntax(&config.condition) {
                    errors.push(format!("invalid loop condition in {}: {}", node.node_id, err));
                }
                if config.max_iterations == 0 {
                    errors.push(format!("loop {} has max_iterations of 0", node.node_id));
                }
                if node.children.is_empty() {
                    errors.push(format!("loop {} has no body", node.node_id));
                }
            }
            NodeKind::Wait(config) => {
                if let Err(err) = expr::check_syntax(&config.condition) {
                    errors.push(format!("invalid wait condition in {}: {}", node.node_id, err));
                }
            }
            NodeKind::Parallel(config) => {
                if node.children.is_empty() {
                    errors.push(format!("parallel block {} has no children", node.node_id));
                }
                if config.max_concurrency == 0 {
                    errors.push(format!(
                        "parallel block {} has max_concurrency of 0",
                        node.node_id
                    ));
                }
            }
            NodeKind::Task(_) | NodeKind::Sequence => {}
        });
    }
}

impl Default for DslParser {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_condition(condition: &str) -> ConditionType {
    if condition.contains("subtasks.includes") {
        ConditionType::SubtaskCheck
    } else if condition.contains("result.") {
        ConditionType::ResultCheck
    } else if condition.contains("context.") {
        ConditionType::ContextCheck
    } else if ["==", "!=", ">=", "<=", ">", "<"]
        .iter()
        .any(|op| condition.contains(op))
    {
        ConditionType::Comparison
    } else if condition
        .split_whitespace()
        .any(|word| word == "and" || word == "or" || word == "not")
    {
        ConditionType::Logical
    } else {
        ConditionType::Expression
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_single_task() {
        let def = json!({"task": "summarize", "tools": ["text.uppercase"], "parameters": {"x": 1}});
        let result = DslParser::new().parse(&def);
        assert!(result.success, "errors: {:?}", result.errors);
        let root = result.root.unwrap();
        assert_eq!(root.children.len(), 1);
        assert_eq!(root.children[0].type_name(), "task");
        assert_eq!(result.metadata.node_count, 2);
    }

    #[test]
    fn node_ids_are_unique_and_prefixed() {
        let def = json!([
            {"task": "a"},
            {"parallel": [{"task": "b"}, {"task": "c"}]}
        ]);
        let result = DslParser::new().parse(&def);
        assert!(result.success);
        let root = result.root.unwrap();
        let mut ids = Vec::new();
        root.walk(&mut |node| ids.push(node.node_id.clone()));
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len(), "duplicate node id in {:?}", ids);
        assert!(ids[0].starts_with("seq_"));
    }

    #[test]
    fn condition_gets_then_else_branches() {
        let def = json!({
            "if": "context.mode == 'fast'",
            "then": [{"task": "quick"}],
            "else": [{"task": "thorough"}]
        });
        let result = DslParser::new().parse(&def);
        assert!(result.success, "errors: {:?}", result.errors);
        let root = result.root.unwrap();
        let cond = &root.children[0];
        assert_eq!(cond.children.len(), 2);
        assert!(cond.branch("then").is_some());
        assert!(cond.branch("else").is_some());
        match &cond.kind {
            NodeKind::Condition(cfg) => {
                assert_eq!(cfg.condition_type, ConditionType::ContextCheck)
            }
            other => panic!("expected condition, got {:?}", other),
        }
    }

    #[test]
    fn loop_defaults_and_validation() {
        let def = json!({"loop": {"condition": "context.go == true", "body": [{"task": "step"}]}});
        let result = DslParser::new().parse(&def);
        assert!(result.success);
        let root = result.root.unwrap();
        match &root.children[0].kind {
            NodeKind::Loop(cfg) => {
                assert_eq!(cfg.max_iterations, 100);
                assert!(cfg.break_on_error);
            }
            other => panic!("expected loop, got {:?}", other),
        }

        let bad = json!({"loop": {"condition": "true", "body": []}});
        let result = DslParser::new().parse(&bad);
        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.contains("body")));
    }

    #[test]
    fn wait_defaults() {
        let def = json!({"wait": {"condition": "result.task_1.ready == true"}});
        let result = DslParser::new().parse(&def);
        assert!(result.success);
        match &result.root.unwrap().children[0].kind {
            NodeKind::Wait(cfg) => {
                assert_eq!(cfg.timeout, 30.0);
                assert_eq!(cfg.poll_interval, 1.0);
            }
            other => panic!("expected wait, got {:?}", other),
        }
    }

    #[test]
    fn unknown_discriminator_is_an_error() {
        let def = json!({"frobnicate": []});
        let result = DslParser::new().parse(&def);
        assert!(!result.success);
        assert!(result.errors[0].contains("unknown step type"));
    }

    #[test]
    fn bad_condition_syntax_is_an_error() {
        let def = json!({"if": "a === b", "then": [{"task": "x"}]});
        let result = DslParser::new().parse(&def);
        assert!(!result.success);
        assert!(result.errors.iter().any(|e| e.contains("condition syntax")));
    }

    #[test]
    fn parallel_counts_in_metadata() {
        let def = json!([
            {"parallel": [{"task": "a"}, {"task": "b"}]},
            {"parallel": [{"task": "c"}, {"task": "d"}]}
        ]);
        let result = DslParser::new().parse(&def);
        assert!(result.success);
        assert_eq!(result.metadata.parallel_blocks, 2);
    }

    #[test]
    fn tree_serialization_round_trips() {
        let def = json!([
            {"task": "a", "parameters": {"n": 1}},
            {"if": "result.task_2.ok == true", "then": [{"task": "b"}]},
            {"loop": {"condition": "context.more == true", "body": [{"task": "c"}], "max_iterations": 3}}
        ]);
        let result = DslParser::new().parse(&def);
        assert!(result.success, "errors: {:?}", result.errors);
        let tree = result.root.unwrap();
        let round_tripped = DslNode::from_value(tree.to_value()).unwrap();
        assert_eq!(round_tripped, tree);
    }
}
