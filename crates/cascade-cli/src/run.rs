//! Command implementations: the CLI is the reference consumer of the
//! service verbs. Tool and model calls resolve against in-memory
//! providers, which makes `run` a dry-run harness for definitions; wire a
//! real catalog in by embedding `cascade-core` behind your own binary.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use cascade_core::config::CascadeConfig;
use cascade_core::definition::{Owner, WorkflowDefinition, WorkflowEdge, WorkflowNode};
use cascade_core::provider::{ScriptedModelProvider, StaticToolProvider};
use cascade_core::run::{ApprovalDecision, RunOutcome};
use cascade_core::service::{CreateRunInput, WorkflowService};
use cascade_core::store::Database;

/// On-disk definition format: the graph alone, lifecycle fields implied.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DefinitionFile {
    name: String,
    nodes: Vec<WorkflowNode>,
    edges: Vec<WorkflowEdge>,
    #[serde(default)]
    input_schema: Option<Value>,
}

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let parsed: DefinitionFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", file.display()))?;

    let mut definition = WorkflowDefinition::draft(parsed.name, parsed.nodes, parsed.edges);
    definition.input_schema = parsed.input_schema;
    Ok(definition)
}

async fn service(config: CascadeConfig) -> Result<WorkflowService> {
    let db = Arc::new(Database::connect(&config.database).await?);
    Ok(WorkflowService::new(
        db,
        Arc::new(StaticToolProvider::new()),
        Arc::new(ScriptedModelProvider::new()),
        config,
    ))
}

pub fn validate(file: &Path) -> Result<()> {
    let definition = load_definition(file)?;
    definition.validate()?;
    println!(
        "ok: {} nodes, {} edges",
        definition.nodes.len(),
        definition.edges.len()
    );
    Ok(())
}

pub async fn execute(config: CascadeConfig, file: &Path, input: &str) -> Result<()> {
    let definition = load_definition(file)?;
    let input: Value = serde_json::from_str(input).context("--input must be valid JSON")?;

    let svc = service(config).await?;
    svc.create_definition(&definition).await?;

    let run = svc
        .create_run(CreateRunInput {
            definition_id: definition.id,
            input,
            owner: Owner::default(),
        })
        .await?;

    println!("run {}", run.id);
    report(svc.start_run(run.id).await?);
    Ok(())
}

pub async fn resume(
    config: CascadeConfig,
    run_id: Uuid,
    approve: bool,
    by: String,
    reason: Option<String>,
) -> Result<()> {
    let svc = service(config).await?;
    let decision = ApprovalDecision {
        approved: approve,
        approved_by: Some(by),
        reason,
        data: None,
    };
    report(svc.resume_run(run_id, decision).await?);
    Ok(())
}

pub async fn list_runs(config: CascadeConfig, workflow_id: Uuid, limit: i64) -> Result<()> {
    let svc = service(config).await?;
    let runs = svc.list_runs_for_workflow(workflow_id, limit).await?;
    if runs.is_empty() {
        bail!("no runs recorded for workflow {workflow_id}");
    }
    for run in runs {
        println!(
            "{}  {:<10}  v{}  created {}",
            run.id,
            run.status.as_str(),
            run.workflow_version,
            run.created_at.to_rfc3339()
        );
    }
    Ok(())
}

pub async fn list_steps(config: CascadeConfig, run_id: Uuid) -> Result<()> {
    let svc = service(config).await?;
    let steps = svc.get_steps(run_id).await?;
    if steps.is_empty() {
        bail!("no steps recorded for run {run_id}");
    }
    for step in steps {
        println!(
            "{:>3}  {:<12}  {:<10}  {}ms",
            step.step_number,
            step.node_id,
            step.status.as_str(),
            step.duration_ms.unwrap_or(0)
        );
    }
    Ok(())
}

fn report(outcome: RunOutcome) {
    match outcome {
        RunOutcome::Completed { output } => {
            println!("completed");
            println!("{}", serde_json::to_string_pretty(&output).unwrap_or_default());
        }
        RunOutcome::Suspended {
            approval_id,
            node_id,
        } => {
            println!("suspended at node '{node_id}' (approval {approval_id})");
            println!("resume with: cascade resume <run-id> --approve --by <user>");
        }
        RunOutcome::Failed { error } => {
            println!("failed");
            println!("{}", serde_json::to_string_pretty(&error).unwrap_or_default());
        }
        RunOutcome::Cancelled => println!("cancelled"),
    }
}
