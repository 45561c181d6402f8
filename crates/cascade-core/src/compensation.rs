//! Compensation (saga) engine.
//!
//! As forward tool nodes succeed, the executor appends undo entries to the
//! run's plan. On unrecoverable failure the plan replays in LIFO order as a
//! best-effort rollback: every entry is attempted, failures are recorded
//! and do not stop the sweep.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::provider::ToolProvider;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One recorded undo action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationEntry {
    /// Node whose forward effect this entry undoes.
    pub node_id: String,
    /// Tool that produced the forward effect.
    pub tool_name: String,
    /// Undo action name, dispatched like a tool.
    pub compensate_action: String,
    /// Undo arguments; `None` replays the forward arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensate_args: Option<Value>,
}

/// Append-only stack of undo actions, serialized into the run snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompensationPlan {
    entries: Vec<CompensationEntry>,
}

impl CompensationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry in forward execution order.
    pub fn add(&mut self, entry: CompensationEntry) {
        self.entries.push(entry);
    }

    /// Entries in rollback (LIFO) order. The plan itself is not mutated.
    pub fn rollback_order(&self) -> Vec<&CompensationEntry> {
        self.entries.iter().rev().collect()
    }

    pub fn entries(&self) -> &[CompensationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

/// Outcome of one rollback attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub node_id: String,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a rollback sweep. `total == succeeded + failed` and
/// `results.len() == total` always hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<RollbackResult>,
}

/// Replay the plan's entries in LIFO order against the tool runtime.
///
/// Best-effort: a failing undo action is recorded and the sweep continues.
/// The input plan is not consumed or mutated, so the caller can persist it
/// alongside the summary.
pub async fn run_rollback(plan: &CompensationPlan, tools: &dyn ToolProvider) -> RollbackSummary {
    let ordered = plan.rollback_order();
    let mut results = Vec::with_capacity(ordered.len());
    let mut succeeded = 0;
    let mut failed = 0;

    info!(total = ordered.len(), "starting compensation rollback");

    for entry in ordered {
        let args = entry
            .compensate_args
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default()));

        match tools.execute_tool(&entry.compensate_action, &args).await {
            Ok(_) => {
                succeeded += 1;
                results.push(RollbackResult {
                    node_id: entry.node_id.clone(),
                    action: entry.compensate_action.clone(),
                    success: true,
                    error: None,
                });
            }
            Err(e) => {
                warn!(
                    node_id = %entry.node_id,
                    action = %entry.compensate_action,
                    error = %e,
                    "compensation action failed"
                );
                failed += 1;
                results.push(RollbackResult {
                    node_id: entry.node_id.clone(),
                    action: entry.compensate_action.clone(),
                    success: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    info!(total = results.len(), succeeded, failed, "compensation rollback complete");

    RollbackSummary {
        total: results.len(),
        succeeded,
        failed,
        results,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
