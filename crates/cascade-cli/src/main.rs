use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

mod run;

#[derive(Parser)]
#[command(name = "cascade", version, about = "Cascade workflow orchestrator")]
struct Cli {
    /// Path to cascade.toml (defaults apply when absent).
    #[arg(long, global = true, default_value = "cascade.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition file without executing it.
    Validate {
        /// Definition JSON file ({name, nodes, edges, inputSchema?}).
        file: PathBuf,
    },
    /// Execute a workflow definition with the given input.
    Run {
        /// Definition JSON file.
        file: PathBuf,
        /// Run input as a JSON object.
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Deliver an approval decision to a suspended run.
    Resume {
        /// Run id returned by `run`.
        run_id: Uuid,
        /// Approve (default is reject).
        #[arg(long)]
        approve: bool,
        /// Who decided.
        #[arg(long, default_value = "cli")]
        by: String,
        /// Optional decision reason.
        #[arg(long)]
        reason: Option<String>,
    },
    /// List persisted runs of a workflow.
    Runs {
        /// Workflow definition id.
        workflow_id: Uuid,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show the step records of one run.
    Steps {
        run_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    cascade_core::init_tracing();

    let cli = Cli::parse();
    let config = cascade_core::config::load_config(&cli.config)?;

    match cli.command {
        Command::Validate { file } => run::validate(&file),
        Command::Run { file, input } => run::execute(config, &file, &input).await,
        Command::Resume {
            run_id,
            approve,
            by,
            reason,
        } => run::resume(config, run_id, approve, by, reason).await,
        Command::Runs { workflow_id, limit } => run::list_runs(config, workflow_id, limit).await,
        Command::Steps { run_id } => run::list_steps(config, run_id).await,
    }
}
