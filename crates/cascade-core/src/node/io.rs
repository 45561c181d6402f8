//! `input` and `output` node semantics: identity over their bindings.

use serde_json::Value;

use crate::definition::{OutputNodeConfig, WorkflowEdge, WorkflowNode};
use crate::interpolate::{interpolate_value, Scope};
use crate::node::NodeExecution;
use crate::Result;

/// The `input` node publishes the run input under its node id.
pub(crate) fn run_input(run_input: &Value) -> NodeExecution {
    NodeExecution::new(run_input.clone(), run_input.clone())
}

/// The `output` node resolves its value template against step results and
/// marks the run's designated output. With no template it passes through
/// the first upstream node's output.
pub(crate) fn run_output(
    node: &WorkflowNode,
    inbound: &[WorkflowEdge],
    scope: &Scope,
) -> Result<NodeExecution> {
    let config: OutputNodeConfig = node.config()?;

    let value = match config.value {
        Some(template) => interpolate_value(&template, scope),
        None => inbound
            .first()
            .and_then(|edge| scope.lookup(&edge.source).cloned())
            .unwrap_or(Value::Null),
    };

    Ok(NodeExecution::new(value.clone(), value))
}
