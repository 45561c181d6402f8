//! `tool` node: argument interpolation and dispatch through the tool
//! provider, with compensation recording and approval gating.

use std::sync::Mutex;

use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::approval::ApprovalCoordinator;
use crate::compensation::{CompensationEntry, CompensationPlan};
use crate::definition::{ToolNodeConfig, WorkflowNode};
use crate::interpolate::{interpolate_value, Scope};
use crate::node::{ApprovalAsk, NodeExecution, NodeOutcome};
use crate::provider::ToolProvider;
use crate::run::ApprovalKind;
use crate::Result;

/// Stable identifier for one tool invocation site within a run, used to
/// match recorded approvals.
pub(crate) fn tool_call_id(run_id: Uuid, node_id: &str) -> String {
    format!("{run_id}:{node_id}")
}

pub(crate) async fn run(
    node: &WorkflowNode,
    scope: &Scope,
    run_id: Uuid,
    tools: &dyn ToolProvider,
    coordinator: &ApprovalCoordinator,
    plan: &Mutex<CompensationPlan>,
) -> Result<NodeOutcome> {
    let config: ToolNodeConfig = node.config()?;
    let args = interpolate_value(&config.args, scope);

    // A catalog-gated tool suspends the run unless a confirmation has
    // already been recorded for this exact invocation site.
    if tools.requires_approval(&config.tool_name) {
        let call_id = tool_call_id(run_id, &node.id);
        if !coordinator.consume(&call_id, &config.tool_name) {
            debug!(node_id = %node.id, tool = %config.tool_name, "tool requires approval");
            return Ok(NodeOutcome::NeedsApproval(ApprovalAsk {
                kind: ApprovalKind::ToolCall,
                message: Some(format!(
                    "Tool '{}' requires approval before execution",
                    config.tool_name
                )),
                context: None,
                approvers: Vec::new(),
                timeout_minutes: None,
                tool_name: Some(config.tool_name.clone()),
                args: Some(args.clone()),
            }));
        }
    }

    let output = tools.execute_tool(&config.tool_name, &args).await?;

    // Compensation is recorded only after the forward call succeeded.
    if let Some(comp) = tools.compensation_for(&config.tool_name) {
        plan.lock().unwrap().add(CompensationEntry {
            node_id: node.id.clone(),
            tool_name: config.tool_name.clone(),
            compensate_action: comp.action,
            compensate_args: Some(resolve_undo_args(comp.args, &args, scope)),
        });
    }

    Ok(NodeOutcome::Completed(NodeExecution::new(
        json!({ "toolName": config.tool_name, "args": args }),
        output,
    )))
}

/// Undo arguments: the catalog's declared args (interpolated against the
/// current scope) or, absent those, the forward call's arguments.
fn resolve_undo_args(declared: Option<Value>, forward_args: &Value, scope: &Scope) -> Value {
    match declared {
        Some(template) => interpolate_value(&template, scope),
        None => forward_args.clone(),
    }
}
