//! `edgeflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate` — parse a workflow definition JSON file and report faults.
//! - `run`      — execute a workflow definition with the built-in nodes
//!   (plus any plug-ins discovered from `--plugins`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::info;

use engine::{RunStatus, WorkflowEngine, WorkflowParser};
use nodes::discovery::NodeDiscovery;
use nodes::NodeRegistry;

#[derive(Parser)]
#[command(
    name = "edgeflow",
    about = "Edge-routed workflow execution engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Also check node types against the built-in registry.
        #[arg(long)]
        with_builtins: bool,
    },
    /// Execute a workflow definition JSON file.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// JSON object merged over the definition's initialState.
        #[arg(long)]
        state: Option<String>,
        /// Directory to scan for node plug-in libraries.
        #[arg(long)]
        plugins: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate {
            path,
            with_builtins,
        } => validate(&path, with_builtins),
        Command::Run {
            path,
            state,
            plugins,
        } => run(&path, state, plugins).await,
    }
}

fn read_definition(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("{} is not valid JSON", path.display()))
}

fn builtin_registry() -> Result<Arc<NodeRegistry>> {
    let registry = Arc::new(NodeRegistry::new());
    nodes::builtin::register_builtins(&registry)
        .context("failed to register built-in nodes")?;
    Ok(registry)
}

fn validate(path: &Path, with_builtins: bool) -> Result<()> {
    let raw = read_definition(path)?;

    let parser = if with_builtins {
        WorkflowParser::with_registry(builtin_registry()?)
    } else {
        WorkflowParser::new()
    };

    match parser.parse(&raw) {
        Ok(parsed) => {
            let edge_faults = engine::validate_all_edges(&parsed);
            if !edge_faults.is_empty() {
                for fault in &edge_faults {
                    eprintln!("❌ {fault}");
                }
                std::process::exit(1);
            }

            let order: Vec<&str> = parsed.roots().map(|n| n.node_id.as_str()).collect();
            println!(
                "✅ Workflow '{}' is valid ({} nodes). Authoring order: {order:?}",
                parsed.id,
                parsed.len()
            );
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("❌ {error}");
            }
            std::process::exit(1);
        }
    }
}

async fn run(path: &Path, state: Option<String>, plugins: Option<PathBuf>) -> Result<()> {
    let raw = read_definition(path)?;
    let registry = builtin_registry()?;

    // The discovery handle keeps plug-in libraries loaded for the whole run.
    let discovery = NodeDiscovery::new();
    if let Some(directory) = &plugins {
        let report = discovery
            .discover(&registry, directory)
            .with_context(|| format!("plug-in discovery in {}", directory.display()))?;
        info!(
            registered = report.registered,
            skipped = report.skipped.len(),
            "plug-in discovery finished"
        );
    }

    let workflow_engine = WorkflowEngine::with_defaults(registry);

    let parsed = match workflow_engine.parse(&raw) {
        Ok(parsed) => parsed,
        Err(errors) => {
            for error in &errors {
                eprintln!("❌ {error}");
            }
            std::process::exit(1);
        }
    };

    let mut initial_state = parsed.initial_state.clone().unwrap_or_else(|| json!({}));
    if let Some(overlay) = state {
        let patch: Value =
            serde_json::from_str(&overlay).context("--state must be valid JSON")?;
        engine::deep_merge(&mut initial_state, patch);
    }

    let execution_id = workflow_engine
        .create_execution(&parsed.id, Some(initial_state))
        .await?;
    info!(execution_id = %execution_id, workflow_id = %parsed.id, "starting execution");

    let outcome = workflow_engine.run_parsed(&parsed, &execution_id).await;
    workflow_engine.complete_execution(&execution_id, None);

    println!("{}", serde_json::to_string_pretty(&outcome.final_state)?);

    match outcome.status {
        RunStatus::Completed => {
            println!("✅ Execution completed");
            Ok(())
        }
        RunStatus::Failed => {
            for error in &outcome.errors {
                eprintln!("❌ {error}");
            }
            std::process::exit(1);
        }
    }
}
