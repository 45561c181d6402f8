//! Step repository: append-only node outcome records.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::definition::NodeKind;
use crate::run::WorkflowStep;
use crate::{EngineError, Result};

use super::{encode_json, parse_datetime, parse_json, parse_opt_datetime, parse_opt_json, parse_uuid, Database};

pub struct StepRepository<'a> {
    db: &'a Database,
}

impl<'a> StepRepository<'a> {
    pub(super) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append a step record outside a snapshot transaction.
    pub async fn append(&self, step: &WorkflowStep) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        insert_step(&mut tx, step).await?;
        tx.commit().await?;
        Ok(())
    }

    /// All steps of a run, ordered by step number.
    pub async fn list_for_run(&self, run_id: Uuid) -> Result<Vec<WorkflowStep>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_run_steps WHERE run_id = ?1 ORDER BY step_number ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(step_from_row).collect()
    }
}

pub(super) async fn insert_step(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    step: &WorkflowStep,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_run_steps
            (id, run_id, node_id, node_type, step_number, status, input,
             output, error, started_at, completed_at, duration_ms,
             tool_execution_id, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#,
    )
    .bind(step.id.to_string())
    .bind(step.run_id.to_string())
    .bind(&step.node_id)
    .bind(step.node_type.to_string())
    .bind(step.step_number)
    .bind(step.status.as_str())
    .bind(encode_json(&step.input)?)
    .bind(step.output.as_ref().map(encode_json).transpose()?)
    .bind(&step.error)
    .bind(step.started_at.map(|t| t.to_rfc3339()))
    .bind(step.completed_at.map(|t| t.to_rfc3339()))
    .bind(step.duration_ms)
    .bind(&step.tool_execution_id)
    .bind(step.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn step_from_row(row: &SqliteRow) -> Result<WorkflowStep> {
    let id: String = row.try_get("id")?;
    let run_id: String = row.try_get("run_id")?;
    let node_type: String = row.try_get("node_type")?;
    let status: String = row.try_get("status")?;
    let input: String = row.try_get("input")?;
    let created_at: String = row.try_get("created_at")?;

    let node_type: NodeKind = serde_json::from_value(Value::String(node_type.clone()))
        .map_err(|_| EngineError::Internal(format!("unknown node_type column '{node_type}'")))?;

    Ok(WorkflowStep {
        id: parse_uuid(&id)?,
        run_id: parse_uuid(&run_id)?,
        node_id: row.try_get("node_id")?,
        node_type,
        step_number: row.try_get("step_number")?,
        status: status
            .parse()
            .map_err(|e: String| EngineError::Internal(e))?,
        input: parse_json(&input)?,
        output: parse_opt_json(row.try_get("output")?)?,
        error: row.try_get("error")?,
        started_at: parse_opt_datetime(row.try_get("started_at")?)?,
        completed_at: parse_opt_datetime(row.try_get("completed_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
        tool_execution_id: row.try_get("tool_execution_id")?,
        created_at: parse_datetime(&created_at)?,
    })
}
