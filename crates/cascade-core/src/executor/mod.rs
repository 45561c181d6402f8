//! Workflow executor: topological traversal, edge routing, retries,
//! suspension, and snapshot orchestration.
//!
//! One `execute` (or `resume`) call drives one run on the caller's task.
//! The executor walks the top-level topological order sequentially;
//! `parallel` nodes and parallel loops fan out within the node. After every
//! node transition the step record and the full-state snapshot commit
//! together, so the latest snapshot alone is enough to resume.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::ApprovalCoordinator;
use crate::compensation::{run_rollback, CompensationPlan};
use crate::config::{CascadeConfig, ExecutorConfig, RetryConfig};
use crate::definition::{NodeKind, WorkflowDefinition, WorkflowNode};
use crate::graph::GraphIndex;
use crate::interpolate::Scope;
use crate::node::{self, ApprovalAsk, NodeExecution, NodeOutcome};
use crate::provider::{ModelProvider, ToolProvider};
use crate::run::{
    ApprovalDecision, ApprovalKind, EngineState, PendingApprovalState, RunOutcome, RunStatus,
    StepStatus, WorkflowRun, WorkflowStep,
};
use crate::store::runs::RunPatch;
use crate::store::Database;
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    store: Arc<Database>,
    tools: Arc<dyn ToolProvider>,
    model: Arc<dyn ModelProvider>,
    coordinator: Arc<ApprovalCoordinator>,
    http: reqwest::Client,
    config: CascadeConfig,
}

/// Shared per-run context threaded through node dispatch.
#[derive(Clone)]
pub(crate) struct RunContext<'a> {
    pub definition: &'a WorkflowDefinition,
    pub index: &'a GraphIndex,
    pub run_id: Uuid,
    pub run_input: &'a Value,
    pub session_id: Option<String>,
    pub cancel: CancellationToken,
    pub compensation: Arc<Mutex<CompensationPlan>>,
}

/// Mutable traversal state, snapshot-shaped.
struct RunState {
    step_results: HashMap<String, Value>,
    completed: HashSet<String>,
    skipped: HashSet<String>,
    compensation: Arc<Mutex<CompensationPlan>>,
    pending_approval: Option<PendingApprovalState>,
    next_step_number: i64,
}

impl RunState {
    fn new() -> Self {
        Self {
            step_results: HashMap::new(),
            completed: HashSet::new(),
            skipped: HashSet::new(),
            compensation: Arc::new(Mutex::new(CompensationPlan::new())),
            pending_approval: None,
            next_step_number: 1,
        }
    }

    fn from_engine_state(state: EngineState) -> Self {
        Self {
            step_results: state.step_results,
            completed: state.completed.into_iter().collect(),
            skipped: state.skipped.into_iter().collect(),
            compensation: Arc::new(Mutex::new(state.compensation)),
            pending_approval: state.pending_approval,
            next_step_number: state.next_step_number,
        }
    }

    fn to_engine_state(&self) -> EngineState {
        let mut completed: Vec<String> = self.completed.iter().cloned().collect();
        let mut skipped: Vec<String> = self.skipped.iter().cloned().collect();
        completed.sort();
        skipped.sort();
        EngineState {
            step_results: self.step_results.clone(),
            completed,
            skipped,
            compensation: self.compensation.lock().unwrap().clone(),
            pending_approval: self.pending_approval.clone(),
            next_step_number: self.next_step_number,
        }
    }

    fn scope(&self) -> Scope {
        Scope::root(self.step_results.clone())
    }

    fn is_settled(&self, node_id: &str) -> bool {
        self.completed.contains(node_id) || self.skipped.contains(node_id)
    }
}

impl Executor {
    pub fn new(
        store: Arc<Database>,
        tools: Arc<dyn ToolProvider>,
        model: Arc<dyn ModelProvider>,
        coordinator: Arc<ApprovalCoordinator>,
        config: CascadeConfig,
    ) -> Self {
        Self {
            store,
            tools,
            model,
            coordinator,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub(crate) fn settings(&self) -> &ExecutorConfig {
        &self.config.executor
    }

    /// Drive a pending run to its first suspension or terminal state and
    /// onward until it terminates. Suspension and terminal outcomes are
    /// both reported through `signals` as they occur; the terminal outcome
    /// is also returned.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        cancel: CancellationToken,
        signals: mpsc::Sender<RunOutcome>,
    ) -> RunOutcome {
        let mut state = RunState::new();
        self.run_to_terminal(definition, run, &mut state, None, cancel, signals)
            .await
    }

    /// Continue a suspended run with a human decision. Restores the
    /// snapshot, settles the pending approval, and resumes traversal from
    /// the approval node's successors.
    pub async fn resume(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        decision: ApprovalDecision,
        cancel: CancellationToken,
        signals: mpsc::Sender<RunOutcome>,
    ) -> RunOutcome {
        let Some(engine_state) = run.engine_state.clone() else {
            let error = EngineError::Conflict(format!("run {} has no snapshot to resume", run.id));
            let outcome = RunOutcome::Failed {
                error: error.to_json(),
            };
            let _ = signals.send(outcome.clone()).await;
            return outcome;
        };

        let mut state = RunState::from_engine_state(engine_state);
        self.run_to_terminal(definition, run, &mut state, Some(decision), cancel, signals)
            .await
    }

    async fn run_to_terminal(
        &self,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        state: &mut RunState,
        resume: Option<ApprovalDecision>,
        cancel: CancellationToken,
        signals: mpsc::Sender<RunOutcome>,
    ) -> RunOutcome {
        let index = match GraphIndex::build(definition) {
            Ok(index) => index,
            Err(e) => return self.finalize(run.id, state, Err(e), &signals).await,
        };

        let rctx = RunContext {
            definition,
            index: &index,
            run_id: run.id,
            run_input: &run.input,
            session_id: run.user_id.clone(),
            cancel,
            compensation: state.compensation.clone(),
        };

        info!(
            run_id = %run.id,
            definition_id = %definition.id,
            version = definition.version,
            resuming = resume.is_some(),
            "run execution starting"
        );

        if let Err(e) = self
            .store
            .runs()
            .update_status(
                run.id,
                RunPatch {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
            )
            .await
        {
            return self.finalize(run.id, state, Err(e), &signals).await;
        }

        let result = self.drive(&rctx, state, resume, &signals).await;
        self.finalize(run.id, state, result, &signals).await
    }

    // -----------------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        rctx: &RunContext<'_>,
        state: &mut RunState,
        resume: Option<ApprovalDecision>,
        signals: &mpsc::Sender<RunOutcome>,
    ) -> Result<Value> {
        if let Some(decision) = resume {
            let pending = state.pending_approval.take().ok_or_else(|| {
                EngineError::Conflict(format!("run {} is not awaiting an approval", rctx.run_id))
            })?;
            self.settle_decision(rctx, state, pending, decision).await?;
        }

        let order = rctx.index.top_level.clone();
        for node_id in &order {
            if state.is_settled(node_id) {
                continue;
            }
            if rctx.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let node = rctx
                .definition
                .node(node_id)
                .ok_or_else(|| EngineError::Internal(format!("node '{node_id}' vanished")))?;

            if self.is_branch_blocked(rctx, state, node_id) {
                debug!(run_id = %rctx.run_id, node_id, "node skipped: branch not taken");
                self.skip_node(rctx, state, node).await?;
                continue;
            }

            self.run_node(rctx, state, node, signals).await?;
        }

        Ok(self.run_output(rctx, state))
    }

    /// A ready node is skipped when every inbound edge comes from a
    /// completed condition whose selected branch differs from the edge
    /// label. Edges from skipped sources stay passable: a skipped node's
    /// successors run as if it had completed with a null output.
    fn is_branch_blocked(&self, rctx: &RunContext<'_>, state: &RunState, node_id: &str) -> bool {
        let Some(edges) = rctx.index.inbound.get(node_id) else {
            return false;
        };
        if edges.is_empty() {
            return false;
        }

        let mut blocking = 0usize;
        for edge in edges {
            let source_is_condition = rctx
                .definition
                .node(&edge.source)
                .map(|n| n.kind == NodeKind::Condition)
                .unwrap_or(false);
            if !source_is_condition || !state.completed.contains(&edge.source) {
                continue;
            }
            let Some(label) = &edge.label else {
                continue;
            };
            let branch = state
                .step_results
                .get(&edge.source)
                .and_then(|v| v.get("branch"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            if label != branch {
                blocking += 1;
            }
        }

        blocking == edges.len()
    }

    async fn run_node(
        &self,
        rctx: &RunContext<'_>,
        state: &mut RunState,
        node: &WorkflowNode,
        signals: &mpsc::Sender<RunOutcome>,
    ) -> Result<()> {
        let started_at = Utc::now();
        let scope = state.scope();

        debug!(run_id = %rctx.run_id, node_id = %node.id, kind = %node.kind, "executing node");

        match self.execute_with_retry(rctx, node, &scope).await {
            Ok(NodeOutcome::Completed(execution)) => {
                self.complete_node(rctx, state, node, execution, started_at)
                    .await
            }
            Ok(NodeOutcome::NeedsApproval(ask)) => {
                let (pending, decision) = self
                    .suspend_for_approval(rctx, state, node, ask, signals)
                    .await?;
                self.settle_decision(rctx, state, pending, decision).await
            }
            Err(error) => {
                warn!(run_id = %rctx.run_id, node_id = %node.id, %error, "node failed");
                self.fail_node(rctx, state, node, &error, started_at).await?;
                Err(error)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Per-node execution: retry, timeout, dispatch
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        rctx: &RunContext<'_>,
        node: &WorkflowNode,
        scope: &Scope,
    ) -> Result<NodeOutcome> {
        let policy = node
            .retry_policy
            .clone()
            .unwrap_or_default()
            .resolve(&self.config.retry);

        let mut attempt = 1u32;
        loop {
            let result = self.dispatch_with_timeout(rctx, node, scope).await;
            match result {
                Err(error) if error.is_retryable() && attempt < policy.max_attempts => {
                    let delay = retry_delay(&policy, attempt);
                    warn!(
                        run_id = %rctx.run_id,
                        node_id = %node.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "node attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = rctx.cancel.cancelled() => return Err(EngineError::Cancelled),
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn dispatch_with_timeout(
        &self,
        rctx: &RunContext<'_>,
        node: &WorkflowNode,
        scope: &Scope,
    ) -> Result<NodeOutcome> {
        let ceiling = Duration::from_secs(
            node.timeout_seconds
                .unwrap_or(self.config.executor.default_node_timeout_seconds),
        );

        let dispatched = tokio::time::timeout(ceiling, self.dispatch(rctx, node, scope));
        tokio::select! {
            result = dispatched => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(timeout_error(node, ceiling)),
            },
            _ = rctx.cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Boxed so composite nodes can recurse through the executor.
    fn dispatch<'a>(
        &'a self,
        rctx: &'a RunContext<'a>,
        node: &'a WorkflowNode,
        scope: &'a Scope,
    ) -> BoxFuture<'a, Result<NodeOutcome>> {
        Box::pin(async move {
            match node.kind {
                NodeKind::Input => Ok(NodeOutcome::Completed(node::io::run_input(rctx.run_input))),
                NodeKind::Output => {
                    let inbound = rctx
                        .index
                        .inbound
                        .get(&node.id)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    Ok(NodeOutcome::Completed(node::io::run_output(
                        node, inbound, scope,
                    )?))
                }
                NodeKind::AiStep => Ok(NodeOutcome::Completed(
                    node::ai_step::run(node, scope, self.model.as_ref()).await?,
                )),
                NodeKind::Tool => {
                    node::tool::run(
                        node,
                        scope,
                        rctx.run_id,
                        self.tools.as_ref(),
                        &self.coordinator,
                        &rctx.compensation,
                    )
                    .await
                }
                NodeKind::Condition => Ok(NodeOutcome::Completed(node::condition::run(
                    node, scope,
                )?)),
                NodeKind::Loop => Ok(NodeOutcome::Completed(
                    node::loop_node::run(self, rctx, node, scope).await?,
                )),
                NodeKind::Parallel => Ok(NodeOutcome::Completed(
                    node::parallel::run(self, rctx, node, scope).await?,
                )),
                NodeKind::Approval => Ok(NodeOutcome::NeedsApproval(node::approval::ask(
                    node, scope,
                )?)),
                NodeKind::Delay => Ok(NodeOutcome::Completed(
                    node::delay::run(node, &rctx.cancel).await?,
                )),
                NodeKind::Webhook => Ok(NodeOutcome::Completed(
                    node::webhook::run(node, scope, &self.http).await?,
                )),
            }
        })
    }

    /// Execute a composite body node under the given scope. Body nodes get
    /// the same retry and timeout treatment as top-level nodes but produce
    /// no step records; their results live inside the composite's output.
    pub(crate) async fn execute_body_node(
        &self,
        rctx: &RunContext<'_>,
        node_id: &str,
        scope: &Scope,
    ) -> Result<NodeExecution> {
        let node = rctx
            .definition
            .node(node_id)
            .ok_or_else(|| EngineError::Internal(format!("body node '{node_id}' vanished")))?;

        match self.execute_with_retry(rctx, node, scope).await? {
            NodeOutcome::Completed(execution) => Ok(execution),
            NodeOutcome::NeedsApproval(_) => Err(EngineError::Internal(format!(
                "node '{node_id}' cannot suspend inside a composite body"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Suspension and approval settlement
    // -----------------------------------------------------------------------

    /// The suspension ritual: register the pending approval, persist the
    /// snapshot with the pending pointer, report `Suspended`, then block on
    /// the decision signal under the run's cancellation context and the
    /// approval timeout.
    async fn suspend_for_approval(
        &self,
        rctx: &RunContext<'_>,
        state: &mut RunState,
        node: &WorkflowNode,
        ask: ApprovalAsk,
        signals: &mpsc::Sender<RunOutcome>,
    ) -> Result<(PendingApprovalState, ApprovalDecision)> {
        let approval_id = Uuid::new_v4();
        let timeout_minutes = ask
            .timeout_minutes
            .unwrap_or(self.config.approval.default_timeout_minutes);

        let pending = PendingApprovalState {
            approval_id,
            node_id: node.id.clone(),
            kind: ask.kind,
            tool_name: ask.tool_name.clone(),
            args: ask.args.clone(),
            message: ask.message.clone(),
            context: ask.context.clone(),
            approvers: ask.approvers.clone(),
            requested_at: Utc::now(),
            timeout_minutes,
        };

        let receiver = self.coordinator.request_approval(
            approval_id,
            rctx.run_id,
            node.id.clone(),
            ask.tool_name,
            ask.args,
            ask.message,
            rctx.session_id.clone(),
        );

        // The snapshot with the pending pointer must be durable before the
        // run blocks, so a crashed process can still resume from it.
        state.pending_approval = Some(pending.clone());
        self.store
            .runs()
            .update_status(
                rctx.run_id,
                RunPatch {
                    status: Some(RunStatus::Suspended),
                    engine_state: Some(state.to_engine_state()),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            run_id = %rctx.run_id,
            node_id = %node.id,
            %approval_id,
            timeout_minutes,
            "run suspended for approval"
        );

        let _ = signals
            .send(RunOutcome::Suspended {
                approval_id,
                node_id: node.id.clone(),
            })
            .await;

        let timeout = Duration::from_secs(timeout_minutes * 60);
        let decision = tokio::select! {
            received = receiver => match received {
                Ok(decision) => decision,
                // The record was removed without a decision; treat it as a
                // rejection rather than leaving the run wedged.
                Err(_) => ApprovalDecision::reject("approval record removed"),
            },
            _ = tokio::time::sleep(timeout) => {
                self.coordinator.remove(approval_id);
                return Err(EngineError::ApprovalTimeout {
                    node_id: node.id.clone(),
                    timeout_minutes,
                });
            }
            _ = rctx.cancel.cancelled() => {
                self.coordinator.remove(approval_id);
                return Err(EngineError::Cancelled);
            }
        };

        state.pending_approval = None;
        self.store
            .runs()
            .update_status(
                rctx.run_id,
                RunPatch {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
            )
            .await?;

        Ok((pending, decision))
    }

    /// Turn a delivered decision into the suspended node's completion. An
    /// approved approval node yields the decision payload; an approved
    /// gated tool records the confirmation and executes the tool. Rejection
    /// is terminal.
    async fn settle_decision(
        &self,
        rctx: &RunContext<'_>,
        state: &mut RunState,
        pending: PendingApprovalState,
        decision: ApprovalDecision,
    ) -> Result<()> {
        let node = rctx.definition.node(&pending.node_id).ok_or_else(|| {
            EngineError::Internal(format!("suspended node '{}' vanished", pending.node_id))
        })?;

        if !decision.approved {
            let error = EngineError::ApprovalRejected {
                node_id: pending.node_id.clone(),
                reason: decision.reason.clone(),
            };
            self.fail_node(rctx, state, node, &error, pending.requested_at)
                .await?;
            return Err(error);
        }

        let started_at = Utc::now();
        let execution = match pending.kind {
            ApprovalKind::Node => NodeExecution::new(
                json!({ "message": pending.message, "approvers": pending.approvers }),
                node::approval::decision_output(&decision),
            ),
            ApprovalKind::ToolCall => {
                let call_id = node::tool::tool_call_id(rctx.run_id, &pending.node_id);
                if let Some(tool_name) = &pending.tool_name {
                    self.coordinator.record(&call_id, tool_name);
                }
                let scope = state.scope();
                match self.execute_with_retry(rctx, node, &scope).await {
                    Ok(NodeOutcome::Completed(execution)) => execution,
                    Ok(NodeOutcome::NeedsApproval(_)) => {
                        return Err(EngineError::Internal(format!(
                            "tool node '{}' asked for approval twice",
                            pending.node_id
                        )))
                    }
                    Err(error) => {
                        self.fail_node(rctx, state, node, &error, started_at).await?;
                        return Err(error);
                    }
                }
            }
        };

        self.complete_node(rctx, state, node, execution, started_at)
            .await
    }

    // -----------------------------------------------------------------------
    // State transitions and persistence
    // -----------------------------------------------------------------------

    async fn complete_node(
        &self,
        rctx: &RunContext<'_>,
        state: &mut RunState,
        node: &WorkflowNode,
        execution: NodeExecution,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        state
            .step_results
            .insert(node.id.clone(), execution.output.clone());
        state.completed.insert(node.id.clone());

        let step = self.build_step(
            rctx,
            state,
            node,
            StepStatus::Completed,
            execution.input,
            Some(execution.output),
            None,
            started_at,
        );
        state.next_step_number += 1;

        self.persist_step(rctx, state, &step).await
    }

    async fn skip_node(
        &self,
        rctx: &RunContext<'_>,
        state: &mut RunState,
        node: &WorkflowNode,
    ) -> Result<()> {
        state.step_results.insert(node.id.clone(), Value::Null);
        state.skipped.insert(node.id.clone());

        let now = Utc::now();
        let step = self.build_step(
            rctx,
            state,
            node,
            StepStatus::Skipped,
            Value::Null,
            Some(Value::Null),
            None,
            now,
        );
        state.next_step_number += 1;

        self.persist_step(rctx, state, &step).await
    }

    async fn fail_node(
        &self,
        rctx: &RunContext<'_>,
        state: &mut RunState,
        node: &WorkflowNode,
        error: &EngineError,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let step = self.build_step(
            rctx,
            state,
            node,
            StepStatus::Failed,
            Value::Null,
            None,
            Some(error.to_string()),
            started_at,
        );
        state.next_step_number += 1;

        self.persist_step(rctx, state, &step).await
    }

    #[allow(clippy::too_many_arguments)]
    fn build_step(
        &self,
        rctx: &RunContext<'_>,
        state: &RunState,
        node: &WorkflowNode,
        status: StepStatus,
        input: Value,
        output: Option<Value>,
        error: Option<String>,
        started_at: chrono::DateTime<Utc>,
    ) -> WorkflowStep {
        let completed_at = Utc::now();
        let tool_execution_id = (node.kind == NodeKind::Tool)
            .then(|| node::tool::tool_call_id(rctx.run_id, &node.id));

        WorkflowStep {
            id: Uuid::new_v4(),
            run_id: rctx.run_id,
            node_id: node.id.clone(),
            node_type: node.kind,
            step_number: state.next_step_number,
            status,
            input,
            output,
            error,
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
            tool_execution_id,
            created_at: completed_at,
        }
    }

    async fn persist_step(
        &self,
        rctx: &RunContext<'_>,
        state: &RunState,
        step: &WorkflowStep,
    ) -> Result<()> {
        let snapshot = serde_json::to_string(&state.to_engine_state())
            .map_err(|e| EngineError::Internal(format!("snapshot not encodable: {e}")))?;
        self.store
            .record_step_and_snapshot(step, RunStatus::Running, &snapshot)
            .await
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    fn run_output(&self, rctx: &RunContext<'_>, state: &RunState) -> Value {
        rctx.definition
            .nodes
            .iter()
            .find(|n| n.kind == NodeKind::Output)
            .and_then(|n| state.step_results.get(&n.id))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Write the terminal record: rollback on failure or cancellation,
    /// then the single terminal status transition.
    async fn finalize(
        &self,
        run_id: Uuid,
        state: &mut RunState,
        result: Result<Value>,
        signals: &mpsc::Sender<RunOutcome>,
    ) -> RunOutcome {
        let outcome = match result {
            Ok(output) => {
                state.pending_approval = None;
                let patch = RunPatch {
                    status: Some(RunStatus::Completed),
                    output: Some(output.clone()),
                    engine_state: Some(state.to_engine_state()),
                    ..Default::default()
                };
                if let Err(e) = self.store.runs().update_status(run_id, patch).await {
                    warn!(%run_id, error = %e, "failed to persist completed state");
                }
                info!(%run_id, "run completed");
                RunOutcome::Completed { output }
            }
            Err(EngineError::Cancelled) => {
                self.rollback(run_id, state).await;
                state.pending_approval = None;
                let patch = RunPatch {
                    status: Some(RunStatus::Cancelled),
                    error: Some(EngineError::Cancelled.to_json()),
                    engine_state: Some(state.to_engine_state()),
                    ..Default::default()
                };
                if let Err(e) = self.store.runs().update_status(run_id, patch).await {
                    warn!(%run_id, error = %e, "failed to persist cancelled state");
                }
                info!(%run_id, "run cancelled");
                RunOutcome::Cancelled
            }
            Err(error) => {
                self.rollback(run_id, state).await;
                state.pending_approval = None;
                let error_json = error.to_json();
                let patch = RunPatch {
                    status: Some(RunStatus::Failed),
                    error: Some(error_json.clone()),
                    engine_state: Some(state.to_engine_state()),
                    ..Default::default()
                };
                if let Err(e) = self.store.runs().update_status(run_id, patch).await {
                    warn!(%run_id, error = %e, "failed to persist failed state");
                }
                info!(%run_id, %error, "run failed");
                RunOutcome::Failed { error: error_json }
            }
        };

        let _ = signals.send(outcome.clone()).await;
        outcome
    }

    /// Best-effort LIFO compensation. Runs to completion regardless of the
    /// run's cancellation state.
    async fn rollback(&self, run_id: Uuid, state: &RunState) {
        let plan = state.compensation.lock().unwrap().clone();
        if plan.is_empty() {
            return;
        }
        let summary = run_rollback(&plan, self.tools.as_ref()).await;
        info!(
            %run_id,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "compensation finished"
        );
    }
}

// ---------------------------------------------------------------------------
// Retry timing
// ---------------------------------------------------------------------------

/// Exponential backoff with a cap and ±20 % jitter.
fn retry_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30) as i32;
    let raw = policy.backoff_ms as f64 * policy.backoff_multiplier.powi(exponent);
    let capped = raw.min(policy.max_backoff_ms as f64);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((capped * jitter).round() as u64)
}

fn timeout_error(node: &WorkflowNode, ceiling: Duration) -> EngineError {
    let message = format!(
        "node '{}' timed out after {}s",
        node.id,
        ceiling.as_secs()
    );
    match node.kind {
        NodeKind::Tool | NodeKind::Webhook => EngineError::ToolFailure {
            tool: node.id.clone(),
            message,
        },
        NodeKind::AiStep => EngineError::ModelFailure {
            model: node.id.clone(),
            message,
        },
        _ => EngineError::Internal(message),
    }
}
