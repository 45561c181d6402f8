//! Run-side model: runs, steps, snapshots, and approval payloads.
//!
//! A run is one execution of a definition. Its `engine_state` snapshot is
//! the unit of durability: completed step results, the compensation plan,
//! and the pending-approval pointer, written in full after every node so
//! resume only ever needs the latest snapshot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::compensation::CompensationPlan;
use crate::definition::NodeKind;

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Lifecycle status of a run. Exactly one terminal status is ever observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// A persisted workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: Uuid,
    pub definition_id: Uuid,
    /// Definition version captured at run-create; later definition updates
    /// never affect an in-flight run.
    pub workflow_version: i64,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub status: RunStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub engine_state: Option<EngineState>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub suspended_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Status of one observed node outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// One observed node outcome within a run. `step_number` is contiguous and
/// strictly increasing in the order outcomes were observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub node_type: NodeKind,
    pub step_number: i64,
    pub status: StepStatus,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub tool_execution_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Engine state snapshot
// ---------------------------------------------------------------------------

/// What kind of suspension a pending approval represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    /// An `approval` node suspended the run.
    Node,
    /// A tool whose catalog entry requires human confirmation.
    ToolCall,
}

/// Durable pointer to the approval a suspended run is waiting on. Enough
/// to reconstruct the in-memory record on another process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApprovalState {
    pub approval_id: Uuid,
    pub node_id: String,
    pub kind: ApprovalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub approvers: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub timeout_minutes: u64,
}

/// Full-state execution snapshot. Written after every node transition; a
/// resume restores the whole map and continues from the suspension point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineState {
    pub step_results: HashMap<String, Value>,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub compensation: CompensationPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApprovalState>,
    pub next_step_number: i64,
}

// ---------------------------------------------------------------------------
// Approval decision and run outcome
// ---------------------------------------------------------------------------

/// Resume payload carrying a human decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApprovalDecision {
    pub fn approve(approved_by: impl Into<String>) -> Self {
        Self {
            approved: true,
            approved_by: Some(approved_by.into()),
            reason: None,
            data: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            approved_by: None,
            reason: Some(reason.into()),
            data: None,
        }
    }
}

/// What a `start_run` / `resume_run` call observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed {
        output: Value,
    },
    Suspended {
        approval_id: Uuid,
        node_id: String,
    },
    Failed {
        error: Value,
    },
    Cancelled,
}

impl RunOutcome {
    /// Reconstruct the outcome a terminal run already observed.
    pub fn from_terminal(run: &WorkflowRun) -> Option<Self> {
        match run.status {
            RunStatus::Completed => Some(Self::Completed {
                output: run.output.clone().unwrap_or(Value::Null),
            }),
            RunStatus::Failed => Some(Self::Failed {
                error: run.error.clone().unwrap_or(Value::Null),
            }),
            RunStatus::Cancelled => Some(Self::Cancelled),
            _ => None,
        }
    }
}
