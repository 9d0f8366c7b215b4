use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Classification of a condition expression, assigned at parse time and
/// used by the engine to pick an evaluator path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    SubtaskCheck,
    ResultCheck,
    ContextCheck,
    Comparison,
    Logical,
    Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNodeConfig {
    pub task_name:  String,
    #[serde(default)]
    pub tools:      Vec<String>,
    #[serde(default)]
    pub parameters: Value,
    pub timeout:    Option<f64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub conditions: Vec<String>,
    /// Explicit dependencies, by task name or node id.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// When set, a SEQUENCE parent keeps going past this step's failure.
    #[serde(default)]
    pub continue_on_failure: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelNodeConfig {
    pub max_concurrency: usize,
    pub wait_for_all:    bool,
    pub fail_fast:       bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionNodeConfig {
    pub condition:      String,
    pub condition_type: ConditionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopNodeConfig {
    pub condition:      String,
    pub max_iterations: u32,
    pub break_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitNodeConfig {
    pub condition:     String,
    pub timeout:       f64,
    pub poll_interval: f64,
}

/// Typed payload of a DSL node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum NodeKind {
    Task(TaskNodeConfig),
    Sequence,
    Parallel(ParallelNodeConfig),
    Condition(ConditionNodeConfig),
    Loop(LoopNodeConfig),
    Wait(WaitNodeConfig),
}

impl NodeKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Task(_) => "task",
            Self::Sequence => "sequence",
            Self::Parallel(_) => "parallel",
            Self::Condition(_) => "condition",
            Self::Loop(_) => "loop",
            Self::Wait(_) => "wait",
        }
    }
}

/// One node of a parsed workflow tree.
///
/// Children are owned; there is no parent pointer — a node's owner is its
/// parent's `children` array. `node_id` is unique across the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DslNode {
    pub node_id:  String,
    #[serde(flatten)]
    pub kind:     NodeKind,
    #[serde(default)]
    pub children: Vec<DslNode>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl DslNode {
    pub fn new(node_id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            node_id:  node_id.into(),
            kind,
            children: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Serialize this tree to a JSON value. Round-trip safe:
    /// `DslNode::from_value(node.to_value()) == node`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: Value) -> Result<Self, String> {
        serde_json::from_value(value).map_err(|e| format!("invalid node tree: {}", e))
    }

    pub fn max_depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(DslNode::max_depth)
            .max()
            .unwrap_or(0)
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(DslNode::node_count).sum::<usize>()
    }

    pub fn parallel_block_count(&self) -> usize {
        let own = usize::from(matches!(self.kind, NodeKind::Parallel(_)));
        own + self
            .children
            .iter()
            .map(DslNode::parallel_block_count)
            .sum::<usize>()
    }

    pub fn find(&self, node_id: &str) -> Option<&DslNode> {
        if self.node_id == node_id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(node_id))
    }

    /// Depth-first walk over the whole tree, parent before children.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a DslNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    /// The `then` branch of a condition node, when present.
    pub fn branch(&self, name: &str) -> Option<&DslNode> {
        self.children
            .iter()
            .find(|c| c.metadata.get("branch").and_then(Value::as_str) == Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tree() -> DslNode {
        let mut root = DslNode::new("seq_1", NodeKind::Sequence);
        root.children.push(DslNode::new(
            "task_2",
            NodeKind::Task(TaskNodeConfig {
                task_name:  "fetch".into(),
                tools:      vec!["web.search".into()],
                parameters: json!({"q": "rust"}),
                timeout:    Some(5.0),
                retry_count: 1,
                conditions: vec![],
                depends_on: vec![],
                continue_on_failure: false,
            }),
        ));
        let mut par = DslNode::new(
            "par_3",
            NodeKind::Parallel(ParallelNodeConfig {
                max_concurrency: 2,
                wait_for_all:    true,
                fail_fast:       false,
            }),
        );
        par.children.push(DslNode::new(
            "task_4",
            NodeKind::Task(TaskNodeConfig {
                task_name:  "a".into(),
                tools:      vec![],
                parameters: Value::Null,
                timeout:    None,
                retry_count: 0,
                conditions: vec![],
                depends_on: vec![],
                continue_on_failure: false,
            }),
        ));
        root.children.push(par);
        root
    }

    #[test]
    fn serde_round_trip_preserves_tree() {
        let tree = sample_tree();
        let value = tree.to_value();
        let back = DslNode::from_value(value).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn tree_metrics() {
        let tree = sample_tree();
        assert_eq!(tree.node_count(), 4);
        assert_eq!(tree.max_depth(), 3);
        assert_eq!(tree.parallel_block_count(), 1);
    }

    #[test]
    fn find_locates_nested_nodes() {
        let tree = sample_tree();
        assert!(tree.find("task_4").is_some());
        assert!(tree.find("nope").is_none());
    }
}
