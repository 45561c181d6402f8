//! In-memory approval coordinator.
//!
//! A process-wide registry of pending approvals. Each entry owns the
//! sending half of a oneshot channel; the suspended executor selects over
//! the receiving half and the run's cancellation token. Durability lives in
//! the run snapshot, not here; cross-process resume reconstructs the
//! record from `engine_state` before delivering a decision.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::run::ApprovalDecision;

/// Read-only view of a pending approval.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub approval_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub tool_name: Option<String>,
    pub args: Option<Value>,
    pub message: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct PendingEntry {
    info: PendingApproval,
    signal: oneshot::Sender<ApprovalDecision>,
}

/// Process-wide approval registry. All access is mutex-guarded; no lock is
/// held across an await point.
#[derive(Default)]
pub struct ApprovalCoordinator {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    recorded: Mutex<HashSet<(String, String)>>,
}

impl ApprovalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending record and return the single-assignment signal the
    /// suspended executor awaits.
    #[allow(clippy::too_many_arguments)]
    pub fn request_approval(
        &self,
        approval_id: Uuid,
        run_id: Uuid,
        node_id: impl Into<String>,
        tool_name: Option<String>,
        args: Option<Value>,
        message: Option<String>,
        session_id: Option<String>,
    ) -> oneshot::Receiver<ApprovalDecision> {
        let (tx, rx) = oneshot::channel();
        let info = PendingApproval {
            approval_id,
            run_id,
            node_id: node_id.into(),
            tool_name,
            args,
            message,
            session_id,
            created_at: Utc::now(),
        };

        debug!(%approval_id, %run_id, node_id = %info.node_id, "approval requested");

        let mut pending = self.pending.lock().unwrap();
        if pending
            .insert(approval_id, PendingEntry { info, signal: tx })
            .is_some()
        {
            warn!(%approval_id, "replaced an existing pending approval record");
        }
        rx
    }

    /// Deliver a decision into the waiting signal and remove the record.
    /// Returns false when no record exists (already decided, timed out, or
    /// owned by another process instance).
    pub fn decide(&self, approval_id: Uuid, decision: ApprovalDecision) -> bool {
        let entry = self.pending.lock().unwrap().remove(&approval_id);
        match entry {
            Some(entry) => {
                debug!(%approval_id, approved = decision.approved, "approval decided");
                // A dropped receiver means the run already gave up on the
                // approval (cancel or timeout); treat as not delivered.
                entry.signal.send(decision).is_ok()
            }
            None => false,
        }
    }

    /// Drop a pending record without delivering a decision. The waiting
    /// executor observes a closed channel.
    pub fn remove(&self, approval_id: Uuid) -> bool {
        self.pending.lock().unwrap().remove(&approval_id).is_some()
    }

    /// Whether a record is currently pending.
    pub fn is_pending(&self, approval_id: Uuid) -> bool {
        self.pending.lock().unwrap().contains_key(&approval_id)
    }

    /// Snapshot of all pending approvals.
    pub fn pending(&self) -> Vec<PendingApproval> {
        self.pending
            .lock()
            .unwrap()
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Mark a `(toolCallId, toolName)` pair as pre-approved.
    pub fn record(&self, tool_call_id: &str, tool_name: &str) {
        self.recorded
            .lock()
            .unwrap()
            .insert((tool_call_id.to_string(), tool_name.to_string()));
    }

    /// Atomically check-and-remove a recorded approval for the pair.
    pub fn consume(&self, tool_call_id: &str, tool_name: &str) -> bool {
        self.recorded
            .lock()
            .unwrap()
            .remove(&(tool_call_id.to_string(), tool_name.to_string()))
    }
}
