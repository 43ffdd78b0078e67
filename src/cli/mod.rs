pub mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::cli::config::SagaflowConfig;
use crate::engine::params::ParamStore;
use crate::engine::runner::WorkflowRunner;
use crate::services::Services;
use crate::storage::WorkflowStore;
use crate::storage::json_store::JsonWorkflowStore;
use crate::workflows::WorkflowKind;

#[derive(Parser)]
#[command(name = "sagaflow", version, about = "Durable saga workflow engine")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the REST API server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0", env = "HOST")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "3000", env = "PORT")]
        port: u16,

        /// Workflow store directory
        #[arg(long, default_value = "data/workflows", env = "STORE_DIR")]
        store_dir: PathBuf,

        /// Maximum concurrently executing workflows
        #[arg(long, env = "SAGAFLOW_MAX_CONCURRENT_WORKFLOWS")]
        max_concurrent: Option<usize>,

        /// Path to a sagaflow.yaml config file (default: auto-detect in cwd)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Submit a workflow
    Submit {
        /// Workflow kind (see `sagaflow types`)
        kind: String,

        /// Input parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        inputs: String,

        /// Print the result payload once the workflow finishes
        #[arg(short, long)]
        wait: bool,

        /// Completion timeout in seconds
        #[arg(long, default_value = "60")]
        timeout: u64,

        /// Workflow store directory
        #[arg(long, default_value = "data/workflows")]
        store_dir: PathBuf,
    },

    /// Show the current state of a workflow
    Status {
        /// Workflow ID
        workflow_id: String,

        /// Workflow store directory
        #[arg(long, default_value = "data/workflows")]
        store_dir: PathBuf,
    },

    /// Show the result payload of a finished workflow
    Result {
        /// Workflow ID
        workflow_id: String,

        /// Workflow store directory
        #[arg(long, default_value = "data/workflows")]
        store_dir: PathBuf,
    },

    /// List workflows
    List {
        /// Number of workflows to skip
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Maximum number of workflows to show
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Workflow store directory
        #[arg(long, default_value = "data/workflows")]
        store_dir: PathBuf,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Dump the full record of a workflow as JSON
    Inspect {
        /// Workflow ID
        workflow_id: String,

        /// Workflow store directory
        #[arg(long, default_value = "data/workflows")]
        store_dir: PathBuf,
    },

    /// List available workflow kinds
    Types,
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    match cli.command {
        Commands::Serve {
            host,
            port,
            store_dir,
            max_concurrent,
            config,
        } => cmd_serve(host, port, store_dir, max_concurrent, config).await,
        Commands::Submit {
            kind,
            inputs,
            wait,
            timeout,
            store_dir,
        } => cmd_submit(kind, inputs, wait, timeout, store_dir).await,
        Commands::Status {
            workflow_id,
            store_dir,
        } => cmd_status(workflow_id, store_dir).await,
        Commands::Result {
            workflow_id,
            store_dir,
        } => cmd_result(workflow_id, store_dir).await,
        Commands::List {
            offset,
            limit,
            store_dir,
            format,
        } => cmd_list(offset, limit, store_dir, format).await,
        Commands::Inspect {
            workflow_id,
            store_dir,
        } => cmd_inspect(workflow_id, store_dir).await,
        Commands::Types => cmd_types(),
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => {
            // Auto-detect .env in current directory
            match dotenvy::dotenv() {
                Ok(path) => info!("Loaded env from {}", path.display()),
                Err(dotenvy::Error::Io(_)) => {
                    // No .env file found — that's fine, silently skip
                }
                Err(e) => {
                    eprintln!("Warning: Failed to parse .env file: {}", e);
                }
            }
        }
    }
}

async fn cmd_serve(
    host: String,
    port: u16,
    store_dir: PathBuf,
    max_concurrent: Option<usize>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = SagaflowConfig::load(config_path.as_deref())?;

    let host = config.host.unwrap_or(host);
    let port = config.port.unwrap_or(port);
    let store_dir = config.store_dir.map(PathBuf::from).unwrap_or(store_dir);
    let max_concurrent = max_concurrent.or(config.max_concurrent_workflows);

    crate::api::serve(&host, port, store_dir, Services::in_memory(), max_concurrent).await
}

async fn cmd_submit(
    kind: String,
    inputs_json: String,
    wait: bool,
    timeout: u64,
    store_dir: PathBuf,
) -> Result<()> {
    let inputs_value: serde_json::Value =
        serde_json::from_str(&inputs_json).with_context(|| "Failed to parse --inputs JSON")?;
    let inputs = ParamStore::from_value(inputs_value)?;

    let store: Arc<dyn WorkflowStore> = Arc::new(JsonWorkflowStore::new(store_dir));
    let runner = WorkflowRunner::new(store, Services::in_memory(), None);

    let id = runner.submit(&kind, inputs).await?;
    println!("Workflow ID: {}", id);

    // The spawned workflow task dies with this one-shot process, so always
    // drive it to a terminal state before returning.
    let record = runner
        .await_completion(&id, Duration::from_secs(timeout))
        .await?;
    println!("Status: {}", record.status);

    if wait {
        let result = runner.result(&id).await?;
        println!("Result ({}):", result.status_code);
        println!("{}", serde_json::to_string_pretty(&result.response)?);
    }

    Ok(())
}

async fn cmd_status(workflow_id: String, store_dir: PathBuf) -> Result<()> {
    let store = JsonWorkflowStore::new(store_dir);
    let record = store
        .get(&workflow_id)
        .await?
        .with_context(|| format!("Workflow '{}' not found", workflow_id))?;

    println!("Workflow: {}", record.id);
    println!("Kind:     {}", record.kind);
    println!("Status:   {}", record.status);
    println!("Step:     {} ({})", record.step_index, record.direction);
    if let Some(ref error) = record.error {
        println!("Error:    {}", error);
    }

    Ok(())
}

async fn cmd_result(workflow_id: String, store_dir: PathBuf) -> Result<()> {
    let store: Arc<dyn WorkflowStore> = Arc::new(JsonWorkflowStore::new(store_dir));
    let runner = WorkflowRunner::new(store, Services::in_memory(), None);

    let result = runner.result(&workflow_id).await?;
    println!("Result ({}):", result.status_code);
    println!("{}", serde_json::to_string_pretty(&result.response)?);

    Ok(())
}

async fn cmd_list(offset: usize, limit: usize, store_dir: PathBuf, format: String) -> Result<()> {
    let store = JsonWorkflowStore::new(store_dir);
    let workflows = store.list(offset, limit).await?;

    if workflows.is_empty() {
        println!("No workflows found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&workflows)?);
        return Ok(());
    }

    // Table format
    println!(
        "{:<38} {:<18} {:<10} {:<24}",
        "WORKFLOW ID", "KIND", "STATUS", "SUBMITTED"
    );
    println!("{}", "-".repeat(90));

    for workflow in &workflows {
        println!(
            "{:<38} {:<18} {:<10} {:<24}",
            workflow.id,
            workflow.kind,
            workflow.status.to_string(),
            workflow.submitted_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\nTotal: {} workflow(s)", workflows.len());
    Ok(())
}

async fn cmd_inspect(workflow_id: String, store_dir: PathBuf) -> Result<()> {
    let store = JsonWorkflowStore::new(store_dir);
    let record = store
        .get(&workflow_id)
        .await?
        .with_context(|| format!("Workflow '{}' not found", workflow_id))?;

    println!("{}", serde_json::to_string_pretty(&record)?);

    Ok(())
}

fn cmd_types() -> Result<()> {
    println!("{:<18} DESCRIPTION", "KIND");
    println!("{}", "-".repeat(70));

    for kind in WorkflowKind::all() {
        println!("{:<18} {}", kind.to_string(), kind.describe());
    }

    println!("\nTotal: {} kind(s)", WorkflowKind::all().len());
    Ok(())
}
