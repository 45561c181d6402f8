//! `condition` node: evaluate a predicate and select a branch label.

use serde_json::json;

use crate::definition::{ConditionConfig, WorkflowNode};
use crate::interpolate::Scope;
use crate::node::NodeExecution;
use crate::predicate;
use crate::Result;

/// Evaluate the node's predicate(s) and produce `{"branch": label}`.
///
/// Expression form selects `"true"` / `"false"`. Case form evaluates cases
/// in order, selecting the first matching case's label, else `"default"`.
/// Outgoing edges whose label differs from the selected branch are not
/// taken; the executor skips their targets.
pub(crate) fn run(node: &WorkflowNode, scope: &Scope) -> Result<NodeExecution> {
    let config: ConditionConfig = node.config()?;

    let branch = if let Some(expression) = &config.expression {
        if predicate::evaluate(expression, scope)? {
            "true".to_string()
        } else {
            "false".to_string()
        }
    } else {
        let mut selected = "default".to_string();
        for case in &config.cases {
            if predicate::evaluate(&case.expression, scope)? {
                selected = case.label.clone();
                break;
            }
        }
        selected
    };

    let input = json!({
        "expression": config.expression,
        "cases": config.cases.len(),
    });

    Ok(NodeExecution::new(input, json!({ "branch": branch })))
}
