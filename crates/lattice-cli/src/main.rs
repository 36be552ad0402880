use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use lattice_core::config::LatticeConfig;
use lattice_core::executor::CliAgentFactory;
use lattice_core::replay::plan_replay;
use lattice_core::sandbox::SandboxSet;
use lattice_core::scheduler::{Engine, StartOutcome};
use lattice_core::storage::{
    ExecutionStore, FsExecutionStore, FsWorkflowStore, WorkflowStore,
};
use lattice_core::validator::validate_workflow;
use lattice_core::workflow::Workflow;

#[derive(Parser)]
#[command(name = "lattice", version, about = "Lattice workflow engine")]
struct Cli {
    /// Path to lattice.toml (defaults to ./lattice.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow from a JSON file and stream its events.
    Run {
        /// Workflow definition file.
        workflow: PathBuf,
        /// User input handed to the input node.
        #[arg(long, default_value = "")]
        input: String,
    },
    /// Pre-flight a workflow definition without running it.
    Validate {
        workflow: PathBuf,
    },
    /// Print the journaled events of a stored execution.
    Events {
        execution_id: String,
    },
    /// Re-run a stored workflow from a chosen node, reusing prior outputs.
    Replay {
        /// Workflow id in the store.
        workflow_id: String,
        /// Source execution to reuse outputs from.
        #[arg(long)]
        source: String,
        /// Node to restart from.
        #[arg(long)]
        from: String,
        #[arg(long, default_value = "")]
        input: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<LatticeConfig> {
    match path {
        Some(path) => LatticeConfig::load(path).context("loading config"),
        None => Ok(LatticeConfig::load_or_default()),
    }
}

fn load_workflow_file(path: &PathBuf) -> Result<Workflow> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

fn build_engine(config: &LatticeConfig) -> Engine {
    let root = config.storage.root.clone();
    Engine::new(
        config.clone(),
        Arc::new(CliAgentFactory::new(config.agents.clone())),
        Arc::new(SandboxSet::process_backed(config.sandbox.node_path.clone())),
        Arc::new(FsWorkflowStore::new(root.clone())),
        Arc::new(FsExecutionStore::new(root)),
    )
}

async fn stream_and_wait(
    engine: &Engine,
    outcome: StartOutcome,
) -> Result<()> {
    let handle = match outcome {
        StartOutcome::Started(handle) => handle,
        StartOutcome::Invalid(report) => {
            for issue in &report.errors {
                eprintln!("{}", serde_json::to_string(issue)?);
            }
            bail!("workflow failed validation");
        }
    };

    let execution_id = handle.execution_id.clone();
    println!("execution {execution_id}");

    let mut events = engine.subscribe(&execution_id, None).await;
    let printer = tokio::spawn(async move {
        while let Some(record) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&record) {
                println!("{line}");
            }
        }
    });

    // Ctrl-C interrupts the run rather than killing the process outright.
    let interrupter = handle.interrupter();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt requested");
            let _ = interrupter.send(true);
        }
    });

    let result = handle.wait().await;
    let _ = printer.await;

    match result {
        Ok(value) => {
            println!("result: {}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(error) => bail!("execution failed: {error}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    lattice_core::init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Run { workflow, input } => {
            let workflow = load_workflow_file(&workflow)?;
            let engine = build_engine(&config);
            let outcome = engine.start(workflow, input).await;
            stream_and_wait(&engine, outcome).await
        }
        Command::Validate { workflow } => {
            let workflow = load_workflow_file(&workflow)?;
            let report = validate_workflow(&workflow);
            if report.valid {
                println!("ok: {} nodes, {} edges", workflow.nodes.len(), workflow.edges.len());
                Ok(())
            } else {
                for issue in &report.errors {
                    eprintln!("{}", serde_json::to_string(issue)?);
                }
                bail!("{} validation error(s)", report.errors.len());
            }
        }
        Command::Events { execution_id } => {
            let store = FsExecutionStore::new(config.storage.root.clone());
            let events = store.load_events(&execution_id).await?;
            if events.is_empty() {
                bail!("no journal for execution {execution_id}");
            }
            for record in events {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(())
        }
        Command::Replay {
            workflow_id,
            source,
            from,
            input,
        } => {
            let workflow_store = FsWorkflowStore::new(config.storage.root.clone());
            let execution_store = FsExecutionStore::new(config.storage.root.clone());

            let workflow = workflow_store
                .load(&workflow_id)
                .await?
                .with_context(|| format!("workflow '{workflow_id}' not found"))?;
            let summary = execution_store
                .load_summary(&source)
                .await?
                .with_context(|| format!("execution '{source}' not found"))?;

            let plan = plan_replay(&summary, &workflow, &from)
                .map_err(|e| anyhow::anyhow!("replay blocked: {e}"))?;
            for warning in &plan.warnings {
                eprintln!("warning: {warning}");
            }
            println!(
                "reusing {} node(s), re-executing {} node(s)",
                plan.reused.len(),
                plan.re_executed.len()
            );

            let engine = build_engine(&config);
            let outcome = engine.start_replay(workflow, input, plan).await;
            stream_and_wait(&engine, outcome).await
        }
    }
}
