//! Runs a workflow file and streams its events as JSON lines.

mod config;
mod workflow_file;

use braid_workflow::{
    Decision, Engine, EventKind, InMemoryWorkflowStore, RunStatus, WaitOutcome,
};
use clap::Parser;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::RunnerConfig;
use crate::workflow_file::{WorkflowFileError, build_registry, load_workflow};

/// Errors that stop the runner before a run finishes.
#[derive(Debug)]
enum RunnerError {
    Config { details: String },
    WorkflowFile(WorkflowFileError),
    InvalidInput { details: String },
    Engine { details: String },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "invalid configuration: {details}"),
            Self::WorkflowFile(e) => write!(f, "{e}"),
            Self::InvalidInput { details } => write!(f, "invalid --input: {details}"),
            Self::Engine { details } => write!(f, "engine error: {details}"),
        }
    }
}

impl std::error::Error for RunnerError {}

#[derive(Parser)]
#[command(name = "braid-runner", version, about = "Run a workflow file and stream its events")]
struct Cli {
    /// Path to the workflow JSON file
    #[arg(short, long)]
    workflow: PathBuf,

    /// Run input as JSON
    #[arg(short, long, default_value = "{}")]
    input: String,

    /// Allow gated nodes instead of denying them
    #[arg(long)]
    approve: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(report) => {
            error!("{report}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> braid_core::Result<ExitCode, RunnerError> {
    let config = RunnerConfig::from_env().map_err(|e| RunnerError::Config {
        details: e.to_string(),
    })?;
    info!("Loaded configuration");

    let workflow = load_workflow(&cli.workflow).map_err(RunnerError::WorkflowFile)?;
    let input: JsonValue =
        serde_json::from_str(&cli.input).map_err(|e| RunnerError::InvalidInput {
            details: e.to_string(),
        })?;

    let store = Arc::new(InMemoryWorkflowStore::new());
    let engine = Engine::new(build_registry(&workflow), store.clone(), config.engine);

    if let Err(report) = engine.validate(workflow.clone()) {
        for violation in &report.violations {
            eprintln!("{violation}");
        }
        error!(violations = report.violations.len(), "workflow is invalid");
        return Ok(ExitCode::FAILURE);
    }

    let workflow_id = store.insert(workflow).await;
    let run_id = engine
        .submit(workflow_id, input)
        .await
        .map_err(|report| RunnerError::Engine {
            details: report.to_string(),
        })?;
    let mut events = engine
        .follow(run_id, None)
        .await
        .map_err(|report| RunnerError::Engine {
            details: report.to_string(),
        })?;

    let decision = if cli.approve {
        Decision::Allow
    } else {
        Decision::Deny
    };
    while let Some(event) = events.next().await {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "failed to serialize event"),
        }
        if let EventKind::WorkflowConfirmRequired { confirm_id, node_id, .. } = &event.kind {
            info!(%confirm_id, %node_id, %decision, "answering confirmation");
            if let Err(report) = engine.confirm(*confirm_id, decision).await {
                warn!(%confirm_id, error = %report, "confirmation not applied");
            }
        }
    }

    let outcome = engine.wait_all(&[run_id], Duration::from_secs(5)).await;
    engine.shutdown().await;
    match outcome.first().map(|(_, outcome)| *outcome) {
        Some(WaitOutcome::Terminal(RunStatus::Succeeded)) => Ok(ExitCode::SUCCESS),
        Some(outcome) => {
            info!(?outcome, "run did not succeed");
            Ok(ExitCode::FAILURE)
        }
        None => Ok(ExitCode::FAILURE),
    }
}
