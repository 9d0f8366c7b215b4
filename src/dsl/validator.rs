use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::node::{DslNode, NodeKind};
use crate::config::DslConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity:   ValidationSeverity,
    pub message:    String,
    pub node_id:    Option<String>,
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    fn error(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            severity: ValidationSeverity::Error,
            message: message.into(),
            node_id,
            suggestion: None,
        }
    }

    fn warning(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            severity: ValidationSeverity::Warning,
            message: message.into(),
            node_id,
            suggestion: None,
        }
    }

    fn info(message: impl Into<String>, node_id: Option<String>) -> Self {
        Self {
            severity: ValidationSeverity::Info,
            message: message.into(),
            node_id,
            suggestion: None,
        }
    }

    fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Result of semantic validation. `is_valid` holds exactly when no issue
/// has `Error` severity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid:           bool,
    pub issues:             Vec<ValidationIssue>,
    pub dependency_graph:   HashMap<String, Vec<String>>,
    pub execution_order:    Vec<String>,
    pub estimated_duration: Option<f64>,
}

impl ValidationResult {
    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Error)
    }
}

/// Catalog entry for a known task.
#[derive(Debug, Clone, Default)]
pub struct TaskInfo {
    pub required_tools:     Vec<String>,
    pub estimated_duration: Option<f64>,
}

const DEFAULT_TASK_DURATION: f64 = 30.0;
const MAX_DEPTH_WARNING: usize = 20;
const LOOP_ESTIMATE_CAP: u32 = 10;
const DANGEROUS_TOOLS: &[&str] = &["file.delete", "system.execute", "network.request"];

/// Semantic validator for parsed workflow trees.
///
/// Catalogs are optional: with no tasks or tools registered the
/// availability checks are skipped, matching a validator used purely for
/// structural and dependency analysis.
pub struct DslValidator {
    tasks:  HashMap<String, TaskInfo>,
    tools:  HashSet<String>,
    config: DslConfig,
}

impl DslValidator {
    pub fn new() -> Self {
        Self {
            tasks:  HashMap::new(),
            tools:  HashSet::new(),
            config: DslConfig::default(),
        }
    }

    pub fn with_config(mut self, config: DslConfig) -> Self {
        self.config = config;
        self
    }

    pub fn set_available_tasks(&mut self, tasks: HashMap<String, TaskInfo>) {
        self.tasks = tasks;
    }

    pub fn set_available_tools(&mut self, tools: impl IntoIterator<Item = String>) {
        self.tools = tools.into_iter().collect();
    }

    pub fn validate(&self, root: &DslNode) -> ValidationResult {
        let mut issues = Vec::new();

        self.validate_structure(root, &mut issues);

        let dependency_graph = self.build_dependency_graph(root);
        self.validate_dependencies(&dependency_graph, &mut issues);

        self.validate_resources(root, &mut issues);
        self.validate_reachability(root, &mut issues);

        let execution_order = topological_order(&dependency_graph);
        let estimated_duration = self.estimate_duration(root);
        self.validate_performance(root, estimated_duration, &mut issues);
        self.validate_security(root, &mut issues);

        let is_valid = !issues
            .iter()
            .any(|i| i.severity == ValidationSeverity::Error);

        ValidationResult {
            is_valid,
            issues,
            dependency_graph,
            execution_order,
            estimated_duration: Some(estimated_duration),
        }
    }

    // ── Structure ───────────────────────────────────────────────────────

    fn validate_structure(&self, root: &DslNode, issues: &mut Vec<ValidationIssue>) {
        let mut seen = HashSet::new();
        fn visit(
            node: &DslNode,
            depth: usize,
            seen: &mut HashSet<String>,
            issues: &mut Vec<ValidationIssue>,
        ) {
            if !seen.insert(node.node_id.clone()) {
                issues.push(ValidationIssue::error(
                    format!("duplicate node id: {}", node.node_id),
                    Some(node.node_id.clone()),
                ));
            }
            if depth > MAX_DEPTH_WARNING {
                issues.push(
                    ValidationIssue::warning(
                        format!("deep nesting at depth {}", depth),
                        Some(node.node_id.clone()),
                    )
                    .with_suggestion("flatten the workflow structure"),
                );
            }
            match &node.kind {
                NodeKind::Condition(_) => {
                    if node.children.is_empty() {
                        issues.push(ValidationIssue::warning(
                            "condition node has no branches",
                            Some(node.node_id.clone()),
                        ));
                    } else if node.children.len() > 2 {
                        issues.push(ValidationIssue::error(
                            "condition node has more than 2 branches",
                            Some(node.node_id.clone()),
                        ));
                    }
                }
                NodeKind::Parallel(config) => {
                    if node.children.len() < 2 {
                        issues.push(
                            ValidationIssue::warning(
                                "parallel block with less than 2 children",
                                Some(node.node_id.clone()),
                            )
                            .with_suggestion("use a sequence instead"),
                        );
                    }
                    if config.max_concurrency > node.children.len() && !node.children.is_empty() {
                        issues.push(ValidationIssue::warning(
                            "max_concurrency exceeds number of parallel children",
                            Some(node.node_id.clone()),
                        ));
                    }
                }
                NodeKind::Loop(config) => {
                    if config.max_iterations > 1000 {
                        issues.push(
                            ValidationIssue::warning(
                                format!("high max_iterations: {}", config.max_iterations),
                                Some(node.node_id.clone()),
                            )
                            .with_suggestion("reduce max_iterations"),
                        );
                    }
                    if node.children.is_empty() {
                        issues.push(ValidationIssue::error(
                            "loop node has no body",
                            Some(node.node_id.clone()),
                        ));
                    }
                }
                NodeKind::Task(_) | NodeKind::Sequence | NodeKind::Wait(_) => {}
            }
            for child in &node.children {
                visit(child, depth + 1, seen, issues);
            }
        }
        visit(root, 0, &mut seen, issues);
    }

    // ── Dependencies ────────────────────────────────────────────────────

    /// Implicit dependencies: `${result.<id>.<path>}` parameter templates,
    /// `result.<id>` condition references, explicit `depends_on` entries
    /// (resolved by task name, falling back to raw node id), and sequential
    /// sibling order.
    pub fn build_dependency_graph(&self, root: &DslNode) -> HashMap<String, Vec<String>> {
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();

        // Task names can repeat; depends_on by name points at every node
        // carrying that name.
        let mut nodes_by_task_name: HashMap<String, Vec<String>> = HashMap::new();
        root.walk(&mut |node| {
            if let NodeKind::Task(config) = &node.kind {
                nodes_by_task_name
                    .entry(config.task_name.clone())
                    .or_default()
                    .push(node.node_id.clone());
            }
        });

        fn visit(
            node: &DslNode,
            graph: &mut HashMap<String, Vec<String>>,
            by_name: &HashMap<String, Vec<String>>,
        ) {
            let mut deps = Vec::new();
            match &node.kind {
                NodeKind::Condition(config) => {
                    deps.extend(extract_result_refs(&config.condition));
                }
                NodeKind::Task(config) => {
                    deps.extend(extract_template_refs(&config.parameters));
                    for condition in &config.conditions {
                        deps.extend(extract_result_refs(condition));
                    }
                    for dep in &config.depends_on {
                        match by_name.get(dep) {
                            Some(ids) => deps.extend(
                                ids.iter().filter(|id| **id != node.node_id).cloned(),
                            ),
                            None => deps.push(dep.clone()),
                        }
                    }
                }
                NodeKind::Loop(config) => {
                    deps.extend(extract_result_refs(&config.condition));
                }
                NodeKind::Wait(config) => {
                    deps.extend(extract_result_refs(&config.condition));
                }
                NodeKind::Sequence | NodeKind::Parallel(_) => {}
            }
            deps.sort();
            deps.dedup();
            graph.insert(node.node_id.clone(), deps);

            let is_sequence = matches!(node.kind, NodeKind::Sequence);
            let mut prev: Option<&str> = None;
            for child in &node.children {
                visit(child, graph, by_name);
                if is_sequence {
                    if let Some(prev_id) = prev {
                        graph
                            .entry(child.node_id.clone())
                            .or_default()
                            .push(prev_id.to_string());
                    }
                    prev = Some(&child.node_id);
                }
            }
        }

        visit(root, &mut graph, &nodes_by_task_name);
        graph
    }

    fn validate_dependencies(
        &self,
        graph: &HashMap<String, Vec<String>>,
        issues: &mut Vec<ValidationIssue>,
    ) {
        for cycle in find_cycles(graph) {
            issues.push(ValidationIssue::error(
                format!("circular dependency: {}", cycle.join(" -> ")),
                cycle.first().cloned(),
            ));
        }

        let all_nodes: HashSet<&String> = graph.keys().collect();
        for (node, deps) in graph {
            for dep in deps {
                if !all_nodes.contains(dep) {
                    issues.push(ValidationIssue::error(
                        format!("missing dependency: {} required by {}", dep, node),
                        Some(node.clone()),
                    ));
                }
            }
        }
    }

    // ── Resources ───────────────────────────────────────────────────────

    fn validate_resources(&self, root: &DslNode, issues: &mut Vec<ValidationIssue>) {
        root.walk(&mut |node| {
            let config = match &node.kind {
                NodeKind::Task(config) => config,
                _ => return,
            };

            if !self.tasks.is_empty() {
                match self.tasks.get(&config.task_name) {
                    None => issues.push(ValidationIssue::error(
                        format!("task not available: {}", config.task_name),
                        Some(node.node_id.clone()),
                    )),
                    Some(info) => {
                        for required in &info.required_tools {
                            if !config.tools.contains(required) {
                                issues.push(ValidationIssue::warning(
                                    format!(
                                        "missing required tool: {} for task {}",
                                        required, config.task_name
                                    ),
                                    Some(node.node_id.clone()),
                                ));
                            }
                        }
                    }
                }
            }

            if !self.tools.is_empty() {
                for tool in &config.tools {
                    if !self.tools.contains(tool) {
                        issues.push(ValidationIssue::error(
                            format!("tool not available: {}", tool),
                            Some(node.node_id.clone()),
                        ));
                    }
                }
            }
        });
    }

    // ── Reachability ────────────────────────────────────────────────────

    fn validate_reachability(&self, root: &DslNode, issues: &mut Vec<ValidationIssue>) {
        // The tree structure makes every child reachable from the root; the
        // check guards against future graph-shaped extensions and reports
        // nothing for well-formed trees.
        let mut reachable = HashSet::new();
        root.walk(&mut |node| {
            reachable.insert(node.node_id.clone());
        });
        let mut all = HashSet::new();
        root.walk(&mut |node| {
            all.insert(node.node_id.clone());
        });
        for node_id in all.difference(&reachable) {
            issues.push(ValidationIssue::warning(
                format!("unreachable node: {}", node_id),
                Some(node_id.clone()),
            ));
        }
    }

    // ── Performance ─────────────────────────────────────────────────────

    /// SEQUENCE sums, PARALLEL takes the max, CONDITION averages branches,
    /// LOOP multiplies by min(max_iterations, 10), WAIT contributes its
    /// timeout. The loop cap keeps estimates from exploding; it is a
    /// heuristic, not a guarantee.
    pub fn estimate_duration(&self, node: &DslNode) -> f64 {
        match &node.kind {
            NodeKind::Task(config) => self
                .tasks
                .get(&config.task_name)
                .and_then(|info| info.estimated_duration)
                .unwrap_or(DEFAULT_TASK_DURATION),
            NodeKind::Sequence => node
                .children
                .iter()
                .map(|c| self.estimate_duration(c))
                .sum(),
            NodeKind::Parallel(_) => node
                .children
                .iter()
                .map(|c| self.estimate_duration(c))
                .fold(0.0, f64::max),
            NodeKind::Condition(_) => {
                if node.children.is_empty() {
                    0.0
                } else {
                    let total: f64 = node
                        .children
                        .iter()
                        .map(|c| self.estimate_duration(c))
                        .sum();
                    total / node.children.len() as f64
                }
            }
            NodeKind::Loop(config) => {
                let body: f64 = node
                    .children
                    .iter()
                    .map(|c| self.estimate_duration(c))
                    .sum();
                body * f64::from(config.max_iterations.min(LOOP_ESTIMATE_CAP))
            }
            NodeKind::Wait(config) => config.timeout,
        }
    }

    fn validate_performance(
        &self,
        root: &DslNode,
        estimated_duration: f64,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if estimated_duration > self.config.max_execution_duration_secs {
            issues.push(
                ValidationIssue::warning(
                    format!(
                        "estimated duration ({:.1}s) exceeds limit ({:.0}s)",
                        estimated_duration, self.config.max_execution_duration_secs
                    ),
                    None,
                )
                .with_suggestion("optimize the workflow or raise the limit"),
            );
        }

        let mut widest = 0usize;
        root.walk(&mut |node| {
            if matches!(node.kind, NodeKind::Parallel(_)) {
                widest = widest.max(node.children.len());
            }
        });
        if widest > self.config.max_parallel_tasks {
            issues.push(
                ValidationIssue::warning(
                    format!(
                        "maximum parallel tasks ({}) exceeds limit ({})",
                        widest, self.config.max_parallel_tasks
                    ),
                    None,
                )
                .with_suggestion("reduce parallel width or raise the limit"),
            );
        }
    }

    // ── Security ────────────────────────────────────────────────────────

    fn validate_security(&self, root: &DslNode, issues: &mut Vec<ValidationIssue>) {
        root.walk(&mut |node| {
            let config = match &node.kind {
                NodeKind::Task(config) => config,
                _ => return,
            };

            for tool in &config.tools {
                if DANGEROUS_TOOLS.iter().any(|d| tool.contains(d)) {
                    issues.push(
                        ValidationIssue::warning(
                            format!("potentially dangerous tool: {}", tool),
                            Some(node.node_id.clone()),
                        )
                        .with_suggestion("ensure proper security controls are in place"),
                    );
                }
            }

            if let Value::Object(map) = &config.parameters {
                for (key, value) in map {
                    if value.as_str().map(|s| s.contains("${")) == Some(true) {
                        issues.push(
                            ValidationIssue::info(
                                format!("dynamic parameter detected: {}", key),
                                Some(node.node_id.clone()),
                            )
                            .with_suggestion("validate dynamic parameters before use"),
                        );
                    }
                }
            }
        });
    }
}

impl Default for DslValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scan for `result.<id>` references in a condition string.
fn extract_result_refs(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let bytes = text.as_bytes();
    let needle = b"result.";
    let mut i = 0;
    while i + needle.len() <= bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            // Must not be part of a longer identifier like `my_result.`.
            let preceded_by_ident = i > 0
                && (bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_'
                    || bytes[i - 1] == b'.');
            if !preceded_by_ident {
                let start = i + needle.len();
                let mut end = start;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                if end > start && !bytes[start].is_ascii_digit() {
                    refs.push(text[start..end].to_string());
                }
                i = end;
                continue;
            }
        }
        i += 1;
    }
    refs
}

/// Scan parameter values for `${result.<id>...}` templates, recursively.
fn extract_template_refs(value: &Value) -> Vec<String> {
    let mut refs = Vec::new();
    fn visit(value: &Value, refs: &mut Vec<String>) {
        match value {
            Value::String(s) => {
                let mut rest = s.as_str();
                while let Some(pos) = rest.find("${result.") {
                    let start = pos + "${result.".len();
                    let tail = &rest[start..];
                    let end = tail
                        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                        .unwrap_or(tail.len());
                    if end > 0 {
                        refs.push(tail[..end].to_string());
                    }
                    rest = &tail[end..];
                }
            }
            Value::Array(items) => items.iter().for_each(|v| visit(v, refs)),
            Value::Object(map) => map.values().for_each(|v| visit(v, refs)),
            _ => {}
        }
    }
    visit(value, &mut refs);
    refs
}

/// DFS cycle finder; each returned path ends where it started.
fn find_cycles(graph: &HashMap<String, Vec<String>>) -> Vec<Vec<String>> {
    let mut visited = HashSet::new();
    let mut cycles = Vec::new();

    fn dfs(
        node: &str,
        graph: &HashMap<String, Vec<String>>,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
        cycles: &mut Vec<Vec<String>>,
    ) -> bool {
        if let Some(pos) = stack.iter().position(|n| n == node) {
            let mut cycle: Vec<String> = stack[pos..].to_vec();
            cycle.push(node.to_string());
            cycles.push(cycle);
            return true;
        }
        if visited.contains(node) {
            return false;
        }
        visited.insert(node.to_string());
        stack.push(node.to_string());
        for dep in graph.get(node).map(Vec::as_slice).unwrap_or(&[]) {
            if dfs(dep, graph, visited, stack, cycles) {
                stack.pop();
                return true;
            }
        }
        stack.pop();
        false
    }

    let mut nodes: Vec<&String> = graph.keys().collect();
    nodes.sort();
    for node in nodes {
        if !visited.contains(node.as_str()) {
            let mut stack = Vec::new();
            dfs(node, graph, &mut visited, &mut stack, &mut cycles);
        }
    }
    cycles
}

/// Kahn's algorithm; on a cyclic graph the order is truncated to the
/// acyclic prefix.
fn topological_order(graph: &HashMap<String, Vec<String>>) -> Vec<String> {
    // A node's in-degree is its count of satisfiable dependencies; the edge
    // direction is dep -> node.
    let mut in_degree: HashMap<&String, usize> = graph
        .iter()
        .map(|(node, deps)| {
            let count = deps.iter().filter(|d| graph.contains_key(*d)).count();
            (node, count)
        })
        .collect();

    let mut ready: Vec<&String> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(n, _)| *n)
        .collect();
    ready.sort();

    let mut order = Vec::new();
    let mut queue: std::collections::VecDeque<&String> = ready.into_iter().collect();
    while let Some(current) = queue.pop_front() {
        order.push(current.clone());
        let mut unlocked = Vec::new();
        for (node, deps) in graph {
            if deps.iter().any(|d| d == current) {
                let degree = in_degree.get_mut(node).expect("node registered above");
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    unlocked.push(node);
                }
            }
        }
        unlocked.sort();
        queue.extend(unlocked);
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parser::DslParser;
    use serde_json::json;

    fn parse(def: &Value) -> DslNode {
        let result = DslParser::new().parse(def);
        assert!(result.success, "parse errors: {:?}", result.errors);
        result.root.unwrap()
    }

    #[test]
    fn valid_sequence_passes() {
        let tree = parse(&json!([{"task": "a"}, {"task": "b"}]));
        let result = DslValidator::new().validate(&tree);
        assert!(result.is_valid, "issues: {:?}", result.issues);
        assert!(!result.execution_order.is_empty());
    }

    #[test]
    fn sequential_siblings_depend_on_predecessor() {
        let tree = parse(&json!([{"task": "a"}, {"task": "b"}]));
        let validator = DslValidator::new();
        let graph = validator.build_dependency_graph(&tree);
        // task_3 (b) depends on task_2 (a).
        assert_eq!(graph["task_3"], vec!["task_2".to_string()]);
    }

    #[test]
    fn template_refs_contribute_dependencies() {
        let tree = parse(&json!([
            {"task": "a"},
            {"task": "b", "parameters": {"input": "${result.task_2.value}"}}
        ]));
        let graph = DslValidator::new().build_dependency_graph(&tree);
        assert!(graph["task_3"].contains(&"task_2".to_string()));
    }

    #[test]
    fn cycle_is_a_hard_error() {
        // A -> B -> A through depends_on task names.
        let tree = parse(&json!({"sequence": [
            {"task": "A"},
            {"task": "B", "depends_on": "A"},
            {"task": "A", "depends_on": "B"}
        ]}));
        let result = DslValidator::new().validate(&tree);
        assert!(!result.is_valid);
        let cycle_issue = result
            .errors()
            .find(|i| i.message.contains("circular dependency"))
            .expect("must report the cycle");
        assert!(cycle_issue.message.contains("->"));
    }

    #[test]
    fn missing_dependency_is_an_error() {
        let tree = parse(&json!([
            {"task": "b", "parameters": {"input": "${result.task_99.value}"}}
        ]));
        let result = DslValidator::new().validate(&tree);
        assert!(!result.is_valid);
        assert!(result
            .errors()
            .any(|i| i.message.contains("missing dependency: task_99")));
    }

    #[test]
    fn unknown_task_and_tool_from_catalogs() {
        let tree = parse(&json!([{"task": "mystery", "tools": ["laser.fire"]}]));
        let mut validator = DslValidator::new();
        validator.set_available_tasks(
            [("known".to_string(), TaskInfo::default())].into_iter().collect(),
        );
        validator.set_available_tools(vec!["text.uppercase".to_string()]);
        let result = validator.validate(&tree);
        assert!(!result.is_valid);
        assert!(result.errors().any(|i| i.message.contains("task not available")));
        assert!(result.errors().any(|i| i.message.contains("tool not available")));
    }

    #[test]
    fn missing_required_tool_is_a_warning() {
        let tree = parse(&json!([{"task": "report", "tools": []}]));
        let mut validator = DslValidator::new();
        validator.set_available_tasks(
            [(
                "report".to_string(),
                TaskInfo {
                    required_tools: vec!["text.concat".to_string()],
                    estimated_duration: None,
                },
            )]
            .into_iter()
            .collect(),
        );
        let result = validator.validate(&tree);
        assert!(result.is_valid);
        assert!(result.issues.iter().any(|i| {
            i.severity == ValidationSeverity::Warning && i.message.contains("missing required tool")
        }));
    }

    #[test]
    fn duration_estimate_rules() {
        let validator = DslValidator::new();

        let seq = parse(&json!([{"task": "a"}, {"task": "b"}]));
        assert_eq!(validator.estimate_duration(&seq), 60.0);

        let par = parse(&json!({"parallel": [{"task": "a"}, {"task": "b"}]}));
        assert_eq!(validator.estimate_duration(&par), 30.0);

        let lp = parse(&json!({"loop": {
            "condition": "true", "body": [{"task": "a"}], "max_iterations": 50
        }}));
        // Body estimate times the capped iteration count.
        assert_eq!(validator.estimate_duration(&lp), 30.0 * 10.0);

        let wait = parse(&json!({"wait": {"condition": "true", "timeout": 12}}));
        assert_eq!(validator.estimate_duration(&wait), 12.0);
    }

    #[test]
    fn security_heuristics_flag_dangerous_tools() {
        let tree = parse(&json!([{
            "task": "cleanup",
            "tools": ["file.delete"],
            "parameters": {"path": "${context.target}"}
        }]));
        let result = DslValidator::new().validate(&tree);
        assert!(result.is_valid, "warnings only: {:?}", result.issues);
        assert!(result.issues.iter().any(|i| {
            i.severity == ValidationSeverity::Warning
                && i.message.contains("dangerous tool")
        }));
        assert!(result.issues.iter().any(|i| {
            i.severity == ValidationSeverity::Info && i.message.contains("dynamic parameter")
        }));
    }

    #[test]
    fn parallel_width_warning() {
        let children: Vec<Value> = (0..12).map(|i| json!({"task": format!("t{}", i)})).collect();
        let tree = parse(&json!({"parallel": children}));
        let result = DslValidator::new().validate(&tree);
        assert!(result
            .issues
            .iter()
            .any(|i| i.message.contains("maximum parallel tasks")));
    }

    #[test]
    fn extract_result_refs_finds_identifiers() {
        let refs = extract_result_refs("result.task_1.ok == true and result.task_2.n > 3");
        assert_eq!(refs, vec!["task_1".to_string(), "task_2".to_string()]);
        assert!(extract_result_refs("my_result.x == 1").is_empty());
    }
}
