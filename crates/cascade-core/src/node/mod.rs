//! Node runtime: the execution semantics of each node kind.
//!
//! Leaf handlers are free functions returning a [`NodeOutcome`]; the
//! executor owns dispatch, retries, timeouts, and the suspension ritual.
//! Composite kinds (`loop`, `parallel`) re-enter the executor to run their
//! body nodes.

pub(crate) mod ai_step;
pub(crate) mod approval;
pub(crate) mod condition;
pub(crate) mod delay;
pub(crate) mod io;
pub(crate) mod loop_node;
pub(crate) mod parallel;
pub(crate) mod tool;
pub(crate) mod webhook;

use serde_json::Value;

use crate::run::ApprovalKind;

/// A finished node execution: what the node consumed (recorded into the
/// step row) and what it produced (recorded into step results). Undo
/// entries earned by successful tool calls go straight onto the run's
/// shared compensation plan so they survive even when a sibling branch
/// fails the node.
#[derive(Debug, Clone)]
pub(crate) struct NodeExecution {
    pub input: Value,
    pub output: Value,
}

impl NodeExecution {
    pub fn new(input: Value, output: Value) -> Self {
        Self { input, output }
    }
}

/// A handler's request to suspend the run for a human decision.
#[derive(Debug, Clone)]
pub(crate) struct ApprovalAsk {
    pub kind: ApprovalKind,
    pub message: Option<String>,
    pub context: Option<Value>,
    pub approvers: Vec<String>,
    pub timeout_minutes: Option<u64>,
    pub tool_name: Option<String>,
    pub args: Option<Value>,
}

/// Result of dispatching one node.
#[derive(Debug)]
pub(crate) enum NodeOutcome {
    Completed(NodeExecution),
    NeedsApproval(ApprovalAsk),
}
