//! Public verb surface over the engine: create, start, resume, cancel, and
//! ownership-scoped reads.
//!
//! A transport layer (HTTP, RPC) exposes exactly these verbs; the service
//! owns the run-concurrency limiter and the registry of active execution
//! tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::ApprovalCoordinator;
use crate::compensation::run_rollback;
use crate::config::CascadeConfig;
use crate::definition::{DefinitionStatus, Owner, WorkflowDefinition};
use crate::executor::Executor;
use crate::provider::{ModelProvider, ToolProvider};
use crate::run::{ApprovalDecision, RunOutcome, RunStatus, WorkflowRun, WorkflowStep};
use crate::store::runs::{NewRun, RunPatch};
use crate::store::Database;
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Input to [`WorkflowService::create_run`]. Only `definitionId` names the
/// workflow; unknown fields (including legacy aliases) are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateRunInput {
    pub definition_id: Uuid,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub owner: Owner,
}

/// Ownership scope applied to reads. An empty scope reads unscoped and is
/// reserved for trusted internal callers.
#[derive(Debug, Clone, Default)]
pub struct OwnerScope {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
}

struct ActiveRun {
    cancel: CancellationToken,
    signals: Arc<tokio::sync::Mutex<mpsc::Receiver<RunOutcome>>>,
}

type ActiveRuns = Arc<Mutex<HashMap<Uuid, ActiveRun>>>;

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct WorkflowService {
    db: Arc<Database>,
    executor: Arc<Executor>,
    tools: Arc<dyn ToolProvider>,
    coordinator: Arc<ApprovalCoordinator>,
    limiter: Arc<Semaphore>,
    active: ActiveRuns,
}

impl WorkflowService {
    pub fn new(
        db: Arc<Database>,
        tools: Arc<dyn ToolProvider>,
        model: Arc<dyn ModelProvider>,
        config: CascadeConfig,
    ) -> Self {
        let coordinator = Arc::new(ApprovalCoordinator::new());
        let executor = Arc::new(Executor::new(
            db.clone(),
            tools.clone(),
            model,
            coordinator.clone(),
            config.clone(),
        ));

        Self {
            db,
            executor,
            tools,
            coordinator,
            limiter: Arc::new(Semaphore::new(config.executor.max_concurrent_runs)),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn coordinator(&self) -> &Arc<ApprovalCoordinator> {
        &self.coordinator
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate and persist a definition.
    pub async fn create_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        self.db.definitions().create(definition).await
    }

    pub async fn publish_definition(&self, id: Uuid) -> Result<WorkflowDefinition> {
        self.db
            .definitions()
            .update_status(id, DefinitionStatus::Published)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("definition {id}")))
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Validate the definition and input, then persist a `pending` run.
    /// Validation failures return synchronously and create no run record.
    pub async fn create_run(&self, request: CreateRunInput) -> Result<WorkflowRun> {
        let definition = self
            .db
            .definitions()
            .get_by_id(request.definition_id)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("definition {}", request.definition_id))
            })?;

        if definition.status == DefinitionStatus::Archived {
            return Err(EngineError::Validation(format!(
                "definition {} is archived",
                definition.id
            )));
        }

        definition.validate()?;
        validate_input(&definition, &request.input)?;

        let run = self
            .db
            .runs()
            .create(NewRun {
                definition_id: definition.id,
                workflow_version: definition.version,
                owner: request.owner,
                input: request.input,
            })
            .await?;

        info!(run_id = %run.id, definition_id = %definition.id, "run created");
        Ok(run)
    }

    /// Begin executing a pending run. Returns when the run first completes,
    /// suspends, or fails; execution continues on a background task across
    /// suspensions. Excess starts queue on the concurrency limiter.
    pub async fn start_run(&self, run_id: Uuid) -> Result<RunOutcome> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(EngineError::Conflict(format!(
                "run {run_id} is {} and cannot be started",
                run.status.as_str()
            )));
        }

        let definition = self
            .db
            .definitions()
            .get_by_id(run.definition_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("definition {}", run.definition_id)))?;

        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Internal("run limiter closed".to_string()))?;

        let receiver = self.spawn_execution(definition, run, None, permit);
        self.await_signal(run_id, receiver).await
    }

    /// Deliver an approval decision to a suspended run. Idempotent for
    /// terminal runs: the stored outcome is returned and nothing
    /// re-executes.
    pub async fn resume_run(&self, run_id: Uuid, decision: ApprovalDecision) -> Result<RunOutcome> {
        let run = self.load_run(run_id).await?;

        if let Some(outcome) = RunOutcome::from_terminal(&run) {
            return Ok(outcome);
        }
        if run.status != RunStatus::Suspended {
            return Err(EngineError::Conflict(format!(
                "run {run_id} is {} and cannot be resumed",
                run.status.as_str()
            )));
        }

        let pending = run
            .engine_state
            .as_ref()
            .and_then(|s| s.pending_approval.clone())
            .ok_or_else(|| {
                EngineError::Conflict(format!("run {run_id} has no pending approval"))
            })?;

        // In-process resume: the suspended task is still waiting on its
        // oneshot; deliver the decision and read the task's next report.
        let existing = self
            .active
            .lock()
            .unwrap()
            .get(&run_id)
            .map(|active| active.signals.clone());
        if let Some(signals) = existing {
            if self.coordinator.decide(pending.approval_id, decision.clone()) {
                let mut receiver = signals.lock().await;
                return match receiver.recv().await {
                    Some(outcome) => Ok(outcome),
                    None => self.reload_terminal(run_id).await,
                };
            }
        }

        // Cross-process resume: no waiting task in this instance.
        // Reconstruct execution from the snapshot and feed the decision in.
        info!(%run_id, "resuming run from snapshot");
        let definition = self
            .db
            .definitions()
            .get_by_id(run.definition_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("definition {}", run.definition_id)))?;

        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Internal("run limiter closed".to_string()))?;

        let receiver = self.spawn_execution(definition, run, Some(decision), permit);
        self.await_signal(run_id, receiver).await
    }

    /// Cancel a run. An active run observes the cancellation at its next
    /// suspension point and rolls back; a suspended run without a live
    /// task is rolled back from its snapshot here.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let active = {
            let registry = self.active.lock().unwrap();
            registry.get(&run_id).map(|a| a.cancel.clone())
        };

        if let Some(cancel) = active {
            info!(%run_id, "cancelling active run");
            cancel.cancel();
            return Ok(());
        }

        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        // No live task owns this run; roll back from the snapshot and
        // write the terminal state directly.
        if let Some(state) = &run.engine_state {
            if !state.compensation.is_empty() {
                let summary = run_rollback(&state.compensation, self.tools.as_ref()).await;
                info!(
                    %run_id,
                    total = summary.total,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "compensation finished for detached run"
                );
            }
            if let Some(pending) = &state.pending_approval {
                self.coordinator.remove(pending.approval_id);
            }
        }

        self.db
            .runs()
            .update_status(
                run_id,
                RunPatch {
                    status: Some(RunStatus::Cancelled),
                    error: Some(EngineError::Cancelled.to_json()),
                    ..Default::default()
                },
            )
            .await?;
        info!(%run_id, "run cancelled");
        Ok(())
    }

    /// Ownership-scoped read. A run belonging to another owner is
    /// indistinguishable from a missing one.
    pub async fn get_run(&self, run_id: Uuid, scope: OwnerScope) -> Result<Option<WorkflowRun>> {
        match (&scope.user_id, &scope.org_id) {
            (Some(user_id), org) => {
                self.db
                    .runs()
                    .get_by_id_for_user(run_id, user_id, org.as_deref())
                    .await
            }
            (None, Some(org_id)) => self.db.runs().get_by_id_for_org(run_id, org_id).await,
            (None, None) => self.db.runs().get_by_id(run_id).await,
        }
    }

    pub async fn get_steps(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>> {
        self.db.steps().list_for_run(run_id).await
    }

    pub async fn list_runs_for_workflow(
        &self,
        workflow_id: Uuid,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>> {
        self.db.runs().list_by_workflow(workflow_id, limit).await
    }

    pub async fn list_runs_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<WorkflowRun>> {
        self.db.runs().list_by_user(user_id, limit).await
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn spawn_execution(
        &self,
        definition: WorkflowDefinition,
        run: WorkflowRun,
        resume: Option<ApprovalDecision>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> Arc<tokio::sync::Mutex<mpsc::Receiver<RunOutcome>>> {
        let (tx, rx) = mpsc::channel(4);
        let receiver = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();

        self.active.lock().unwrap().insert(
            run.id,
            ActiveRun {
                cancel: cancel.clone(),
                signals: receiver.clone(),
            },
        );

        let executor = self.executor.clone();
        let active = self.active.clone();
        let run_id = run.id;

        tokio::spawn(async move {
            let _permit = permit;
            let outcome = match resume {
                None => executor.execute(&definition, &run, cancel, tx).await,
                Some(decision) => {
                    executor
                        .resume(&definition, &run, decision, cancel, tx)
                        .await
                }
            };
            if let RunOutcome::Failed { ref error } = outcome {
                warn!(%run_id, ?error, "run task finished with failure");
            }
            active.lock().unwrap().remove(&run_id);
        });

        receiver
    }

    async fn await_signal(
        &self,
        run_id: Uuid,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<RunOutcome>>>,
    ) -> Result<RunOutcome> {
        let mut receiver = receiver.lock().await;
        match receiver.recv().await {
            Some(outcome) => Ok(outcome),
            None => self.reload_terminal(run_id).await,
        }
    }

    /// Fallback when the signal channel closed without a report.
    async fn reload_terminal(&self, run_id: Uuid) -> Result<RunOutcome> {
        let run = self.load_run(run_id).await?;
        RunOutcome::from_terminal(&run).ok_or_else(|| {
            EngineError::Internal(format!("run {run_id} task ended without a terminal status"))
        })
    }

    async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun> {
        self.db
            .runs()
            .get_by_id(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
    }
}

/// Minimal input-schema enforcement: a schema may declare `required` field
/// names that must be present on the run input object.
fn validate_input(definition: &WorkflowDefinition, input: &Value) -> Result<()> {
    let Some(schema) = &definition.input_schema else {
        return Ok(());
    };
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };

    let object = input.as_object();
    for field in required.iter().filter_map(Value::as_str) {
        let present = object.map(|o| o.contains_key(field)).unwrap_or(false);
        if !present {
            return Err(EngineError::Validation(format!(
                "run input is missing required field '{field}'"
            )));
        }
    }
    Ok(())
}
