mod steps;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use taskweave_core::config::EngineConfig;
use taskweave_core::event::{EventBus, RunEvent};
use taskweave_core::types::{RunStatus, WorkflowDefinition};
use taskweave_workflow::{DependencyGraph, RunManager};

#[derive(Parser)]
#[command(name = "taskweave", version, about = "Workflow and agent execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "TASKWEAVE_CONFIG", default_value = "taskweave.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a workflow file, build its dependency graph, and check that
    /// every node kind is a registered step
    Validate {
        /// Path to the workflow TOML file
        workflow: PathBuf,
    },
    /// Print a workflow's execution plan as dependency levels
    Plan {
        /// Path to the workflow TOML file
        workflow: PathBuf,
    },
    /// Execute a workflow with the built-in steps, streaming events
    Run {
        /// Path to the workflow TOML file
        workflow: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("taskweave=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("loading config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    match cli.command {
        Commands::Validate { workflow } => validate(&workflow),
        Commands::Plan { workflow } => plan(&workflow),
        Commands::Run { workflow } => run(&workflow, config).await,
        Commands::Config => {
            println!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_workflow(path: &PathBuf) -> anyhow::Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading workflow from {}", path.display()))?;
    let definition: WorkflowDefinition =
        toml::from_str(&raw).with_context(|| format!("parsing workflow {}", path.display()))?;
    Ok(definition)
}

fn validate(path: &PathBuf) -> anyhow::Result<()> {
    let definition = load_workflow(path)?;
    let graph = DependencyGraph::build(&definition)?;
    let registry = steps::builtin_registry()?;
    DependencyGraph::check_kinds(&definition, &registry)?;
    println!(
        "ok: {} node(s), {} level(s)",
        graph.len(),
        graph.topo_levels().len()
    );
    Ok(())
}

fn plan(path: &PathBuf) -> anyhow::Result<()> {
    let definition = load_workflow(path)?;
    let graph = DependencyGraph::build(&definition)?;
    for (i, level) in graph.topo_levels().iter().enumerate() {
        println!("level {}: {}", i, level.join(", "));
    }
    Ok(())
}

async fn run(path: &PathBuf, config: EngineConfig) -> anyhow::Result<()> {
    let definition = load_workflow(path)?;
    let registry = Arc::new(steps::builtin_registry()?);
    let bus = Arc::new(EventBus::default());
    let manager = RunManager::new(registry, config.workflow, Arc::clone(&bus));

    let mut events = bus.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RunEvent::NodeStateChanged {
                    node_id,
                    status,
                    summary,
                    ..
                } => match summary {
                    Some(summary) => println!("  {} -> {:?}: {}", node_id, status, summary),
                    None => println!("  {} -> {:?}", node_id, status),
                },
                RunEvent::RunStateChanged { status, .. } => {
                    println!("run -> {:?}", status);
                }
                _ => {}
            }
        }
    });

    let run_id = manager.submit(definition)?;
    let status = manager.wait(&run_id).await?;
    let snapshot = manager.snapshot(&run_id)?;

    // Let the printer drain buffered events before the final report.
    tokio::task::yield_now().await;
    printer.abort();
    let _ = printer.await;

    let mut nodes: Vec<_> = snapshot.context.nodes().iter().collect();
    nodes.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (node_id, state) in nodes {
        println!(
            "{}: {:?} ({} attempt(s))",
            node_id, state.status, state.attempts
        );
    }

    match status {
        RunStatus::Completed => Ok(()),
        other => {
            warn!(run_id = %run_id, status = ?other, "run did not complete");
            std::process::exit(1);
        }
    }
}
