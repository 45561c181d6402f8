//! Workflow definition model: the labeled DAG interpreted by the executor.
//!
//! Definitions arrive as designer-produced JSON (camelCase keys). Node
//! `data` stays a raw [`serde_json::Value`] on the wire; handlers decode it
//! into the typed per-kind config structs below via [`WorkflowNode::config`].

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::graph;
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

/// The `(userId, orgId)` pair scoping every persisted entity. Either side
/// may be absent; scoped reads apply whichever sides are present as SQL
/// predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
}

impl Owner {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            org_id: None,
        }
    }

    pub fn org(org_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            org_id: Some(org_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Published,
    Archived,
}

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: Uuid,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: DefinitionStatus,
    pub version: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub nodes: Vec<WorkflowNode>,
    pub edges: Vec<WorkflowEdge>,
    #[serde(default)]
    pub input_schema: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Convenience constructor for a fresh draft definition.
    pub fn draft(name: impl Into<String>, nodes: Vec<WorkflowNode>, edges: Vec<WorkflowEdge>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: None,
            org_id: None,
            name: name.into(),
            description: None,
            status: DefinitionStatus::Draft,
            version: 1,
            tags: Vec::new(),
            nodes,
            edges,
            input_schema: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Validate the definition's graph shape and node configuration.
    ///
    /// Checks, in order: unique node ids, edge endpoints, exactly one
    /// `input` node, acyclicity, decodable per-kind node data, and
    /// composite-body consistency. Runs before any run record is created;
    /// a failure here never persists anything.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            if !seen.contains(edge.source.as_str()) {
                return Err(EngineError::Validation(format!(
                    "edge references unknown source node '{}'",
                    edge.source
                )));
            }
            if !seen.contains(edge.target.as_str()) {
                return Err(EngineError::Validation(format!(
                    "edge references unknown target node '{}'",
                    edge.target
                )));
            }
        }

        let inputs: Vec<&WorkflowNode> = self
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Input)
            .collect();
        if inputs.len() != 1 {
            return Err(EngineError::Validation(format!(
                "workflow must contain exactly one input node, found {}",
                inputs.len()
            )));
        }

        // Cycle check over the full node set, body nodes included.
        graph::topological_order(&self.nodes, &self.edges)?;

        self.validate_node_data()?;
        self.validate_bodies()
    }

    /// Decode every node's `data` into its typed config so malformed
    /// definitions fail at create time rather than mid-run.
    fn validate_node_data(&self) -> Result<()> {
        for node in &self.nodes {
            match node.kind {
                NodeKind::Input | NodeKind::Output => {}
                NodeKind::AiStep => {
                    node.config::<AiStepConfig>()?;
                }
                NodeKind::Tool => {
                    node.config::<ToolNodeConfig>()?;
                }
                NodeKind::Condition => {
                    let cfg = node.config::<ConditionConfig>()?;
                    if cfg.expression.is_none() && cfg.cases.is_empty() {
                        return Err(EngineError::Validation(format!(
                            "condition node '{}' needs an expression or cases",
                            node.id
                        )));
                    }
                }
                NodeKind::Loop => {
                    node.config::<LoopConfig>()?;
                }
                NodeKind::Parallel => {
                    node.config::<ParallelConfig>()?;
                }
                NodeKind::Approval => {
                    node.config::<ApprovalNodeConfig>()?;
                }
                NodeKind::Delay => {
                    node.config::<DelayConfig>()?;
                }
                NodeKind::Webhook => {
                    node.config::<WebhookConfig>()?;
                }
            }
        }
        Ok(())
    }

    /// Body membership of a composite node: the targets of its outgoing
    /// `"body"`-labeled edges, deduplicated in edge order. The composite's
    /// unlabeled outgoing edges are post-loop continuations.
    pub fn body_nodes_of(&self, node_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for edge in &self.edges {
            if edge.source == node_id && edge.is_body() && !ids.contains(&edge.target) {
                ids.push(edge.target.clone());
            }
        }
        ids
    }

    /// Composite (loop/parallel) body rules. Membership is declared by
    /// `"body"`-labeled edges leaving the composite: every such edge must
    /// come from a loop or parallel node, each body node belongs to exactly
    /// one composite, and a composite owns at least one body node. A
    /// `bodyNodes` list in node data is cross-checked against the edges.
    /// Bodies must not be input, output, or approval nodes (suspension
    /// inside a body has no snapshot representation).
    fn validate_bodies(&self) -> Result<()> {
        let mut owner: HashMap<&str, &str> = HashMap::new();

        for edge in &self.edges {
            if !edge.is_body() {
                continue;
            }

            let source = self.node(&edge.source).expect("endpoints checked earlier");
            if !matches!(source.kind, NodeKind::Loop | NodeKind::Parallel) {
                return Err(EngineError::Validation(format!(
                    "'body' edge from '{}' is invalid: only loop and parallel nodes own body nodes",
                    edge.source
                )));
            }

            let target = self.node(&edge.target).expect("endpoints checked earlier");
            if matches!(
                target.kind,
                NodeKind::Input | NodeKind::Output | NodeKind::Approval
            ) {
                return Err(EngineError::Validation(format!(
                    "node '{}' of kind '{}' may not be a composite body",
                    target.id, target.kind
                )));
            }

            if let Some(prev) = owner.insert(edge.target.as_str(), edge.source.as_str()) {
                if prev != edge.source {
                    return Err(EngineError::Validation(format!(
                        "node '{}' is a body of both '{prev}' and '{}'",
                        edge.target, edge.source
                    )));
                }
            }
        }

        for node in &self.nodes {
            if !matches!(node.kind, NodeKind::Loop | NodeKind::Parallel) {
                continue;
            }

            let declared = node.declared_body_ids();
            for id in &declared {
                if self.node(id).is_none() {
                    return Err(EngineError::Validation(format!(
                        "node '{}' lists unknown body node '{id}'",
                        node.id
                    )));
                }
            }

            let members = self.body_nodes_of(&node.id);
            if members.is_empty() {
                return Err(EngineError::Validation(format!(
                    "node '{}' has no 'body'-labeled edges",
                    node.id
                )));
            }

            if !declared.is_empty() {
                for id in &declared {
                    if !members.contains(id) {
                        return Err(EngineError::Validation(format!(
                            "node '{}' lists body node '{id}' without a matching 'body' edge",
                            node.id
                        )));
                    }
                }
                for id in &members {
                    if !declared.contains(id) {
                        return Err(EngineError::Validation(format!(
                            "node '{}' has a 'body' edge to '{id}' missing from its bodyNodes list",
                            node.id
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

/// The kind tag of a workflow node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Input,
    Output,
    AiStep,
    Tool,
    Condition,
    Loop,
    Parallel,
    Approval,
    Delay,
    Webhook,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::AiStep => "ai-step",
            Self::Tool => "tool",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Parallel => "parallel",
            Self::Approval => "approval",
            Self::Delay => "delay",
            Self::Webhook => "webhook",
        };
        f.write_str(s)
    }
}

/// A node in the workflow DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub data: Value,
    /// Designer canvas position; opaque to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, data: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            data,
            position: None,
            retry_policy: None,
            timeout_seconds: None,
        }
    }

    /// Decode this node's `data` into a typed per-kind config.
    pub fn config<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            EngineError::Validation(format!("node '{}' has invalid data: {e}", self.id))
        })
    }

    /// Body ids listed in this node's data, empty for non-composites.
    /// These are a designer-facing duplicate of the `"body"`-labeled edges
    /// and are cross-checked during validation; membership itself derives
    /// from the edges.
    pub fn declared_body_ids(&self) -> Vec<String> {
        match self.kind {
            NodeKind::Loop => self
                .config::<LoopConfig>()
                .map(|c| c.body_nodes)
                .unwrap_or_default(),
            NodeKind::Parallel => self
                .config::<ParallelConfig>()
                .map(|c| c.body_nodes)
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

/// Edge label marking a composite's iteration-body edges. Reserved: a
/// condition case may not use it as a branch label.
pub const BODY_EDGE_LABEL: &str = "body";

/// Directed edge. The optional label routes condition branches (`"true"`,
/// `"false"`, a case value, `"default"`) and declares composite bodies: a
/// `"body"`-labeled edge from a loop or parallel node names one of its
/// body nodes, while the composite's unlabeled outgoing edges are
/// post-loop continuations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowEdge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl WorkflowEdge {
    /// Whether this edge marks a composite body.
    pub fn is_body(&self) -> bool {
        self.label.as_deref() == Some(BODY_EDGE_LABEL)
    }

    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
        }
    }

    pub fn labeled(
        source: impl Into<String>,
        target: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: Some(label.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Per-node retry overrides. Fields left unset inherit the centralized
/// [`RetryConfig`] defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
}

impl RetryPolicy {
    /// Merge this policy over the configured defaults.
    pub fn resolve(&self, defaults: &RetryConfig) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            backoff_ms: self.backoff_ms.unwrap_or(defaults.backoff_ms),
            backoff_multiplier: self
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            max_backoff_ms: self.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-kind node data
// ---------------------------------------------------------------------------

/// `ai-step` node data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiStepConfig {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Field name → expected type. Presence forces JSON mode.
    #[serde(default)]
    pub output_schema: Option<HashMap<String, FieldType>>,
}

/// Declared field type for ai-step output validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

/// `tool` node data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolNodeConfig {
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
}

/// One case of a multi-way condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionCase {
    pub expression: String,
    pub label: String,
}

/// `condition` node data: a single boolean expression (branches `"true"` /
/// `"false"`) or an ordered case list (first match wins, else `"default"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub cases: Vec<ConditionCase>,
}

/// Loop body execution mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// `loop` node data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    pub iterator_expression: String,
    #[serde(default = "default_iteration_variable")]
    pub iteration_variable: String,
    #[serde(default = "default_index_variable")]
    pub index_variable: String,
    #[serde(default)]
    pub execution_mode: LoopExecutionMode,
    #[serde(default)]
    pub break_condition: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u64>,
    /// Optional duplicate of the node's `"body"`-labeled edges; when
    /// present it must match them exactly.
    #[serde(default)]
    pub body_nodes: Vec<String>,
}

fn default_iteration_variable() -> String {
    "item".to_string()
}

fn default_index_variable() -> String {
    "index".to_string()
}

/// `parallel` node data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelConfig {
    /// Optional duplicate of the node's `"body"`-labeled edges; when
    /// present it must match them exactly.
    #[serde(default)]
    pub body_nodes: Vec<String>,
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
}

fn default_fail_fast() -> bool {
    true
}

/// `approval` node data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalNodeConfig {
    pub message: String,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub context: Option<Value>,
}

/// `delay` node data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayConfig {
    pub ms: u64,
}

/// `webhook` node data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_webhook_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub allow_non_2xx: bool,
}

fn default_webhook_method() -> String {
    "POST".to_string()
}

/// `output` node data: an optional template object resolved against step
/// results. Absent, the run output falls back to the single upstream
/// node's output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputNodeConfig {
    #[serde(default)]
    pub value: Option<Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input_node() -> WorkflowNode {
        WorkflowNode::new("input", NodeKind::Input, json!({}))
    }

    fn tool_node(id: &str) -> WorkflowNode {
        WorkflowNode::new(id, NodeKind::Tool, json!({"toolName": "noop", "args": {}}))
    }

    #[test]
    fn node_kind_serde_uses_kebab_case() {
        assert_eq!(serde_json::to_string(&NodeKind::AiStep).unwrap(), "\"ai-step\"");
        let kind: NodeKind = serde_json::from_str("\"ai-step\"").unwrap();
        assert_eq!(kind, NodeKind::AiStep);
    }

    #[test]
    fn valid_linear_definition_passes() {
        let def = WorkflowDefinition::draft(
            "linear",
            vec![
                input_node(),
                tool_node("t1"),
                WorkflowNode::new("out", NodeKind::Output, json!({})),
            ],
            vec![
                WorkflowEdge::new("input", "t1"),
                WorkflowEdge::new("t1", "out"),
            ],
        );
        def.validate().unwrap();
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let def = WorkflowDefinition::draft(
            "dup",
            vec![input_node(), tool_node("t1"), tool_node("t1")],
            vec![],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let def = WorkflowDefinition::draft(
            "bad-edge",
            vec![input_node()],
            vec![WorkflowEdge::new("input", "ghost")],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn missing_input_node_is_rejected() {
        let def = WorkflowDefinition::draft("no-input", vec![tool_node("t1")], vec![]);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("exactly one input node"));
    }

    #[test]
    fn two_input_nodes_are_rejected() {
        let def = WorkflowDefinition::draft(
            "two-inputs",
            vec![
                input_node(),
                WorkflowNode::new("input2", NodeKind::Input, json!({})),
            ],
            vec![],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn cycle_is_rejected() {
        let def = WorkflowDefinition::draft(
            "cycle",
            vec![input_node(), tool_node("a"), tool_node("b")],
            vec![
                WorkflowEdge::new("input", "a"),
                WorkflowEdge::new("a", "b"),
                WorkflowEdge::new("b", "a"),
            ],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn malformed_tool_data_is_rejected() {
        let def = WorkflowDefinition::draft(
            "bad-tool",
            vec![
                input_node(),
                WorkflowNode::new("t1", NodeKind::Tool, json!({"args": {}})),
            ],
            vec![WorkflowEdge::new("input", "t1")],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("invalid data"));
    }

    fn loop_node(id: &str, data: Value) -> WorkflowNode {
        WorkflowNode::new(id, NodeKind::Loop, data)
    }

    #[test]
    fn body_membership_comes_from_body_edges() {
        let def = WorkflowDefinition::draft(
            "looped",
            vec![
                input_node(),
                loop_node("l1", json!({"iteratorExpression": "{{input.items}}"})),
                tool_node("b1"),
            ],
            vec![
                WorkflowEdge::new("input", "l1"),
                WorkflowEdge::labeled("l1", "b1", "body"),
            ],
        );
        def.validate().unwrap();
        assert_eq!(def.body_nodes_of("l1"), vec!["b1"]);
        assert!(def.body_nodes_of("input").is_empty());
    }

    #[test]
    fn declared_body_list_must_match_body_edges() {
        // Listed but not wired with a "body" edge.
        let def = WorkflowDefinition::draft(
            "listed-unwired",
            vec![
                input_node(),
                loop_node(
                    "l1",
                    json!({"iteratorExpression": "{{input.items}}", "bodyNodes": ["b1", "b2"]}),
                ),
                tool_node("b1"),
                tool_node("b2"),
            ],
            vec![
                WorkflowEdge::new("input", "l1"),
                WorkflowEdge::labeled("l1", "b1", "body"),
            ],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("without a matching 'body' edge"));

        // Wired but missing from the declared list.
        let def = WorkflowDefinition::draft(
            "wired-unlisted",
            vec![
                input_node(),
                loop_node(
                    "l1",
                    json!({"iteratorExpression": "{{input.items}}", "bodyNodes": ["b1"]}),
                ),
                tool_node("b1"),
                tool_node("b2"),
            ],
            vec![
                WorkflowEdge::new("input", "l1"),
                WorkflowEdge::labeled("l1", "b1", "body"),
                WorkflowEdge::labeled("l1", "b2", "body"),
            ],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("missing from its bodyNodes list"));
    }

    #[test]
    fn composite_without_body_edges_is_rejected() {
        let def = WorkflowDefinition::draft(
            "no-body-edges",
            vec![
                input_node(),
                loop_node("l1", json!({"iteratorExpression": "{{input.items}}"})),
            ],
            vec![WorkflowEdge::new("input", "l1")],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("has no 'body'-labeled edges"));
    }

    #[test]
    fn body_edge_from_non_composite_is_rejected() {
        let def = WorkflowDefinition::draft(
            "tool-body",
            vec![input_node(), tool_node("t1"), tool_node("t2")],
            vec![
                WorkflowEdge::new("input", "t1"),
                WorkflowEdge::labeled("t1", "t2", "body"),
            ],
        );
        let err = def.validate().unwrap_err();
        assert!(err
            .to_string()
            .contains("only loop and parallel nodes own body nodes"));
    }

    #[test]
    fn loop_body_must_exist() {
        let def = WorkflowDefinition::draft(
            "bad-loop",
            vec![
                input_node(),
                loop_node(
                    "l1",
                    json!({"iteratorExpression": "{{input.items}}", "bodyNodes": ["ghost"]}),
                ),
            ],
            vec![WorkflowEdge::new("input", "l1")],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("unknown body node"));
    }

    #[test]
    fn approval_may_not_be_a_body_node() {
        let def = WorkflowDefinition::draft(
            "approval-body",
            vec![
                input_node(),
                WorkflowNode::new("ap", NodeKind::Approval, json!({"message": "ok?"})),
                loop_node("l1", json!({"iteratorExpression": "{{input.items}}"})),
            ],
            vec![
                WorkflowEdge::new("input", "l1"),
                WorkflowEdge::labeled("l1", "ap", "body"),
            ],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("may not be a composite body"));
    }

    #[test]
    fn body_node_owned_twice_is_rejected() {
        let def = WorkflowDefinition::draft(
            "double-owner",
            vec![
                input_node(),
                tool_node("shared"),
                loop_node("l1", json!({"iteratorExpression": "{{input.items}}"})),
                WorkflowNode::new("p1", NodeKind::Parallel, json!({})),
            ],
            vec![
                WorkflowEdge::new("input", "l1"),
                WorkflowEdge::labeled("l1", "shared", "body"),
                WorkflowEdge::labeled("p1", "shared", "body"),
            ],
        );
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("is a body of both"));
    }

    #[test]
    fn retry_policy_merges_over_defaults() {
        let defaults = RetryConfig::default();
        let policy = RetryPolicy {
            max_attempts: Some(7),
            ..Default::default()
        };
        let resolved = policy.resolve(&defaults);
        assert_eq!(resolved.max_attempts, 7);
        assert_eq!(resolved.backoff_ms, defaults.backoff_ms);
        assert_eq!(resolved.max_backoff_ms, defaults.max_backoff_ms);
    }

    #[test]
    fn loop_config_defaults() {
        let node = WorkflowNode::new(
            "l",
            NodeKind::Loop,
            json!({"iteratorExpression": "{{input.xs}}", "bodyNodes": ["b"]}),
        );
        let cfg: LoopConfig = node.config().unwrap();
        assert_eq!(cfg.iteration_variable, "item");
        assert_eq!(cfg.index_variable, "index");
        assert_eq!(cfg.execution_mode, LoopExecutionMode::Sequential);
        assert!(cfg.break_condition.is_none());
    }

    #[test]
    fn definition_serde_round_trip() {
        let def = WorkflowDefinition::draft(
            "rt",
            vec![input_node(), tool_node("t1")],
            vec![WorkflowEdge::labeled("input", "t1", "true")],
        );
        let json = serde_json::to_string(&def).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, def.id);
        assert_eq!(back.nodes.len(), 2);
        assert_eq!(back.edges[0].label.as_deref(), Some("true"));
    }
}
