//! `approval` node: suspend the run for a human decision.
//!
//! The handler only shapes the ask; the executor owns the suspension
//! ritual (snapshot persistence, coordinator registration, awaiting the
//! decision signal).

use chrono::Utc;
use serde_json::{json, Value};

use crate::definition::{ApprovalNodeConfig, WorkflowNode};
use crate::interpolate::{interpolate, interpolate_value, Scope};
use crate::node::ApprovalAsk;
use crate::run::{ApprovalDecision, ApprovalKind};
use crate::Result;

pub(crate) fn ask(node: &WorkflowNode, scope: &Scope) -> Result<ApprovalAsk> {
    let config: ApprovalNodeConfig = node.config()?;

    Ok(ApprovalAsk {
        kind: ApprovalKind::Node,
        message: Some(interpolate(&config.message, scope)),
        context: config.context.as_ref().map(|c| interpolate_value(c, scope)),
        approvers: config.approvers,
        timeout_minutes: config.timeout_minutes,
        tool_name: None,
        args: None,
    })
}

/// The node output produced from an approved decision.
pub(crate) fn decision_output(decision: &ApprovalDecision) -> Value {
    json!({
        "approved": decision.approved,
        "approvedBy": decision.approved_by,
        "approvedAt": Utc::now(),
        "approvalReason": decision.reason,
        "approvalData": decision.data,
    })
}
