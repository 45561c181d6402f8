//! Run persistence: sqlx-backed SQLite repositories.
//!
//! JSON payloads are stored as TEXT columns, UUIDs and timestamps as
//! strings (RFC 3339). Every ownership-scoped read applies the scope in
//! the SQL predicate itself, so rows belonging to another owner are
//! indistinguishable from rows that do not exist.

pub mod definitions;
pub mod runs;
pub mod steps;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::run::{RunStatus, WorkflowStep};
use crate::{EngineError, Result};

use definitions::DefinitionRepository;
use runs::RunRepository;
use steps::StepRepository;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_definitions (
    id            TEXT PRIMARY KEY,
    user_id       TEXT,
    org_id        TEXT,
    name          TEXT NOT NULL,
    description   TEXT,
    status        TEXT NOT NULL,
    version       INTEGER NOT NULL,
    tags          TEXT NOT NULL DEFAULT '[]',
    nodes         TEXT NOT NULL,
    edges         TEXT NOT NULL,
    input_schema  TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_definitions_org  ON workflow_definitions(org_id, id);
CREATE INDEX IF NOT EXISTS idx_definitions_user ON workflow_definitions(user_id, id);

CREATE TABLE IF NOT EXISTS workflow_runs (
    id               TEXT PRIMARY KEY,
    workflow_id      TEXT NOT NULL,
    workflow_version INTEGER NOT NULL,
    user_id          TEXT,
    org_id           TEXT,
    status           TEXT NOT NULL,
    input            TEXT NOT NULL,
    output           TEXT,
    error            TEXT,
    engine_state     TEXT,
    started_at       TEXT,
    completed_at     TEXT,
    suspended_at     TEXT,
    resumed_at       TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_workflow ON workflow_runs(workflow_id, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_org      ON workflow_runs(org_id, id);
CREATE INDEX IF NOT EXISTS idx_runs_user     ON workflow_runs(user_id, id);

CREATE TABLE IF NOT EXISTS workflow_run_steps (
    id                TEXT PRIMARY KEY,
    run_id            TEXT NOT NULL,
    node_id           TEXT NOT NULL,
    node_type         TEXT NOT NULL,
    step_number       INTEGER NOT NULL,
    status            TEXT NOT NULL,
    input             TEXT NOT NULL,
    output            TEXT,
    error             TEXT,
    started_at        TEXT,
    completed_at      TEXT,
    duration_ms       INTEGER,
    tool_execution_id TEXT,
    created_at        TEXT NOT NULL,
    UNIQUE(run_id, step_number)
);
CREATE INDEX IF NOT EXISTS idx_steps_run ON workflow_run_steps(run_id, step_number);
"#;

/// Shared handle over the SQLite pool. Scoped connection acquisition and
/// release are the pool's concern; repositories only run bound queries.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect using the configured url, creating the file if missing, and
    /// bootstrap the schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(EngineError::Database)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        info!(url = %config.url, "database connected");
        Ok(db)
    }

    /// An isolated in-memory database, used by tests and dry runs. A single
    /// connection keeps every query on the same memory store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn definitions(&self) -> DefinitionRepository<'_> {
        DefinitionRepository::new(self)
    }

    pub fn runs(&self) -> RunRepository<'_> {
        RunRepository::new(self)
    }

    pub fn steps(&self) -> StepRepository<'_> {
        StepRepository::new(self)
    }

    /// Append a step record and write the run's snapshot in one
    /// transaction, so an observer never sees a step without its snapshot.
    pub async fn record_step_and_snapshot(
        &self,
        step: &WorkflowStep,
        status: RunStatus,
        engine_state_json: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        steps::insert_step(&mut tx, step).await?;
        runs::write_snapshot(&mut tx, step.run_id, status, engine_state_json).await?;
        tx.commit().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Column codecs
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| EngineError::Internal(format!("invalid uuid column '{raw}': {e}")))
}

pub(crate) fn parse_datetime(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| EngineError::Internal(format!("invalid timestamp column '{raw}': {e}")))
}

pub(crate) fn parse_opt_datetime(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_datetime).transpose()
}

pub(crate) fn parse_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| EngineError::Internal(format!("invalid json column: {e}")))
}

pub(crate) fn parse_opt_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.as_deref().map(parse_json).transpose()
}

pub(crate) fn encode_json(value: &serde_json::Value) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::Internal(format!("value is not JSON-encodable: {e}")))
}
