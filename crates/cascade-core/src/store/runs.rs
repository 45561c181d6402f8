//! Run repository: create, ownership-scoped reads, and status updates with
//! timestamp side-effects.

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::definition::Owner;
use crate::run::{EngineState, RunStatus, WorkflowRun};
use crate::{EngineError, Result};

use super::{
    encode_json, parse_datetime, parse_json, parse_opt_datetime, parse_opt_json, parse_uuid,
    Database,
};

/// Input to [`RunRepository::create`].
#[derive(Debug, Clone)]
pub struct NewRun {
    pub definition_id: Uuid,
    pub workflow_version: i64,
    pub owner: Owner,
    pub input: Value,
}

/// Status transition request. `status` is always written; the payload
/// fields only overwrite their columns when present. Timestamp columns
/// follow the status: `running` sets `started_at` (first time) and
/// `resumed_at` (after a suspension), `suspended` sets `suspended_at`,
/// terminal statuses set `completed_at`.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub output: Option<Value>,
    pub error: Option<Value>,
    pub engine_state: Option<EngineState>,
}

const UPDATE_SQL: &str = r#"
UPDATE workflow_runs SET
    status       = ?2,
    output       = COALESCE(?3, output),
    error        = COALESCE(?4, error),
    engine_state = COALESCE(?5, engine_state),
    started_at   = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?6 ELSE started_at END,
    resumed_at   = CASE WHEN ?2 = 'running' AND suspended_at IS NOT NULL THEN ?6 ELSE resumed_at END,
    suspended_at = CASE WHEN ?2 = 'suspended' THEN ?6 ELSE suspended_at END,
    completed_at = CASE WHEN ?2 IN ('completed','failed','cancelled') THEN ?6 ELSE completed_at END,
    updated_at   = ?6
WHERE id = ?1 AND status NOT IN ('completed','failed','cancelled')
"#;

pub struct RunRepository<'a> {
    db: &'a Database,
}

impl<'a> RunRepository<'a> {
    pub(super) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a new run in `pending` status.
    pub async fn create(&self, new: NewRun) -> Result<WorkflowRun> {
        let now = Utc::now();
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            definition_id: new.definition_id,
            workflow_version: new.workflow_version,
            user_id: new.owner.user_id,
            org_id: new.owner.org_id,
            status: RunStatus::Pending,
            input: new.input,
            output: None,
            error: None,
            engine_state: None,
            started_at: None,
            completed_at: None,
            suspended_at: None,
            resumed_at: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, workflow_version, user_id, org_id, status,
                 input, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.definition_id.to_string())
        .bind(run.workflow_version)
        .bind(run.user_id.clone())
        .bind(run.org_id.clone())
        .bind(run.status.as_str())
        .bind(encode_json(&run.input)?)
        .bind(now.to_rfc3339())
        .execute(self.db.pool())
        .await?;

        Ok(run)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// Org-scoped read. Returns `None` both when the row is missing and
    /// when it belongs to another org.
    pub async fn get_by_id_for_org(&self, id: Uuid, org_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?1 AND org_id = ?2")
            .bind(id.to_string())
            .bind(org_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    /// User-scoped read, optionally narrowed further by org.
    pub async fn get_by_id_for_user(
        &self,
        id: Uuid,
        user_id: &str,
        org_id: Option<&str>,
    ) -> Result<Option<WorkflowRun>> {
        let row = match org_id {
            Some(org_id) => {
                sqlx::query(
                    "SELECT * FROM workflow_runs WHERE id = ?1 AND user_id = ?2 AND org_id = ?3",
                )
                .bind(id.to_string())
                .bind(user_id)
                .bind(org_id)
                .fetch_optional(self.db.pool())
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM workflow_runs WHERE id = ?1 AND user_id = ?2")
                    .bind(id.to_string())
                    .bind(user_id)
                    .fetch_optional(self.db.pool())
                    .await?
            }
        };
        row.as_ref().map(run_from_row).transpose()
    }

    /// Apply a status transition. Terminal statuses are sticky: updating a
    /// run that already terminated affects nothing and returns `None`.
    pub async fn update_status(&self, id: Uuid, patch: RunPatch) -> Result<Option<WorkflowRun>> {
        let status = patch
            .status
            .ok_or_else(|| EngineError::Internal("RunPatch without a status".to_string()))?;

        let engine_state_json = patch
            .engine_state
            .as_ref()
            .map(|state| {
                serde_json::to_string(state)
                    .map_err(|e| EngineError::Internal(format!("engine state not encodable: {e}")))
            })
            .transpose()?;
        let output_json = patch.output.as_ref().map(encode_json).transpose()?;
        let error_json = patch.error.as_ref().map(encode_json).transpose()?;

        let affected = sqlx::query(UPDATE_SQL)
            .bind(id.to_string())
            .bind(status.as_str())
            .bind(output_json)
            .bind(error_json)
            .bind(engine_state_json)
            .bind(Utc::now().to_rfc3339())
            .execute(self.db.pool())
            .await?
            .rows_affected();

        if affected == 0 {
            return Ok(None);
        }
        self.get_by_id(id).await
    }

    pub async fn list_by_workflow(
        &self,
        workflow_id: Uuid,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE workflow_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )
        .bind(workflow_id.to_string())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    pub async fn list_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs WHERE user_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}

/// Transactional snapshot write used by
/// [`Database::record_step_and_snapshot`].
pub(super) async fn write_snapshot(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    run_id: Uuid,
    status: RunStatus,
    engine_state_json: &str,
) -> Result<()> {
    sqlx::query(UPDATE_SQL)
        .bind(run_id.to_string())
        .bind(status.as_str())
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .bind(engine_state_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun> {
    let id: String = row.try_get("id")?;
    let workflow_id: String = row.try_get("workflow_id")?;
    let status: String = row.try_get("status")?;
    let input: String = row.try_get("input")?;
    let engine_state: Option<String> = row.try_get("engine_state")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let engine_state = engine_state
        .as_deref()
        .map(|raw| {
            serde_json::from_str::<EngineState>(raw)
                .map_err(|e| EngineError::Internal(format!("invalid engine_state column: {e}")))
        })
        .transpose()?;

    Ok(WorkflowRun {
        id: parse_uuid(&id)?,
        definition_id: parse_uuid(&workflow_id)?,
        workflow_version: row.try_get("workflow_version")?,
        user_id: row.try_get("user_id")?,
        org_id: row.try_get("org_id")?,
        status: status
            .parse()
            .map_err(|e: String| EngineError::Internal(e))?,
        input: parse_json(&input)?,
        output: parse_opt_json(row.try_get("output")?)?,
        error: parse_opt_json(row.try_get("error")?)?,
        engine_state,
        started_at: parse_opt_datetime(row.try_get("started_at")?)?,
        completed_at: parse_opt_datetime(row.try_get("completed_at")?)?,
        suspended_at: parse_opt_datetime(row.try_get("suspended_at")?)?,
        resumed_at: parse_opt_datetime(row.try_get("resumed_at")?)?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn db() -> Database {
        Database::in_memory().await.unwrap()
    }

    fn new_run(owner: Owner) -> NewRun {
        NewRun {
            definition_id: Uuid::new_v4(),
            workflow_version: 1,
            owner,
            input: json!({"id": "42"}),
        }
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let db = db().await;
        let created = db.runs().create(new_run(Owner::org("org-a"))).await.unwrap();

        let loaded = db.runs().get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, created.id);
        assert_eq!(loaded.status, RunStatus::Pending);
        assert_eq!(loaded.input, json!({"id": "42"}));
        assert_eq!(loaded.org_id.as_deref(), Some("org-a"));
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn org_scope_hides_foreign_rows() {
        let db = db().await;
        let run = db.runs().create(new_run(Owner::org("org-a"))).await.unwrap();

        let other = db.runs().get_by_id_for_org(run.id, "org-b").await.unwrap();
        assert!(other.is_none());

        let own = db.runs().get_by_id_for_org(run.id, "org-a").await.unwrap();
        assert!(own.is_some());

        // Missing rows look identical to foreign rows.
        let missing = db
            .runs()
            .get_by_id_for_org(Uuid::new_v4(), "org-a")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn user_scope_with_and_without_org() {
        let db = db().await;
        let run = db
            .runs()
            .create(NewRun {
                definition_id: Uuid::new_v4(),
                workflow_version: 1,
                owner: Owner {
                    user_id: Some("u1".into()),
                    org_id: Some("org-a".into()),
                },
                input: json!({}),
            })
            .await
            .unwrap();

        assert!(db
            .runs()
            .get_by_id_for_user(run.id, "u1", None)
            .await
            .unwrap()
            .is_some());
        assert!(db
            .runs()
            .get_by_id_for_user(run.id, "u1", Some("org-a"))
            .await
            .unwrap()
            .is_some());
        assert!(db
            .runs()
            .get_by_id_for_user(run.id, "u2", None)
            .await
            .unwrap()
            .is_none());
        assert!(db
            .runs()
            .get_by_id_for_user(run.id, "u1", Some("org-b"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn status_transitions_set_timestamps() {
        let db = db().await;
        let run = db.runs().create(new_run(Owner::default())).await.unwrap();

        let running = db
            .runs()
            .update_status(
                run.id,
                RunPatch {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let suspended = db
            .runs()
            .update_status(
                run.id,
                RunPatch {
                    status: Some(RunStatus::Suspended),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(suspended.suspended_at.is_some());
        assert!(suspended.resumed_at.is_none());

        let resumed = db
            .runs()
            .update_status(
                run.id,
                RunPatch {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(resumed.resumed_at.is_some());

        let completed = db
            .runs()
            .update_status(
                run.id,
                RunPatch {
                    status: Some(RunStatus::Completed),
                    output: Some(json!("Alice")),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(completed.completed_at.is_some());
        assert_eq!(completed.output, Some(json!("Alice")));
        assert!(completed.error.is_none());
    }

    #[tokio::test]
    async fn terminal_status_is_sticky() {
        let db = db().await;
        let run = db.runs().create(new_run(Owner::default())).await.unwrap();

        db.runs()
            .update_status(
                run.id,
                RunPatch {
                    status: Some(RunStatus::Failed),
                    error: Some(json!({"code": "tool-failure"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        // A second terminal transition is a no-op.
        let again = db
            .runs()
            .update_status(
                run.id,
                RunPatch {
                    status: Some(RunStatus::Completed),
                    output: Some(json!("late")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(again.is_none());

        let stored = db.runs().get_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert!(stored.output.is_none());
    }

    #[tokio::test]
    async fn engine_state_round_trips_through_the_snapshot_column() {
        let db = db().await;
        let run = db.runs().create(new_run(Owner::default())).await.unwrap();

        let mut state = EngineState {
            next_step_number: 3,
            ..Default::default()
        };
        state.step_results.insert("input".into(), json!({"id": 1}));
        state.completed.push("input".into());

        db.runs()
            .update_status(
                run.id,
                RunPatch {
                    status: Some(RunStatus::Running),
                    engine_state: Some(state.clone()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        let loaded = db.runs().get_by_id(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.engine_state, Some(state));
    }

    #[tokio::test]
    async fn listings_are_scoped_and_bounded() {
        let db = db().await;
        let definition_id = Uuid::new_v4();
        for _ in 0..3 {
            db.runs()
                .create(NewRun {
                    definition_id,
                    workflow_version: 1,
                    owner: Owner::user("u1"),
                    input: json!({}),
                })
                .await
                .unwrap();
        }
        db.runs().create(new_run(Owner::user("u2"))).await.unwrap();

        let by_workflow = db.runs().list_by_workflow(definition_id, 10).await.unwrap();
        assert_eq!(by_workflow.len(), 3);

        let by_user = db.runs().list_by_user("u1", 2).await.unwrap();
        assert_eq!(by_user.len(), 2);

        let by_other = db.runs().list_by_user("u3", 10).await.unwrap();
        assert!(by_other.is_empty());
    }
}
