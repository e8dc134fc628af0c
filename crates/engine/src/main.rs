//! Command line front end for the workflow engine.
//!
//! Run with: cargo run --bin workflow-engine -- [OPTIONS] <COMMAND>

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use workflow_engine::{
    agent::StaticAgentAssigner,
    config::Config,
    metrics,
    monitor::WorkflowMonitor,
    store::{create_store, DatabaseType, Store},
    workflow::{StepExecutor, WorkflowDefinition, WorkflowEngine},
};

#[derive(Parser)]
#[command(author, version, about = "Run and inspect graph-driven workflows", long_about = None)]
struct Cli {
    /// Log level (debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a workflow definition file (YAML or JSON)
    Validate {
        file: PathBuf,
    },

    /// Store a definition, start an instance and print where it ended up
    Run {
        file: PathBuf,

        /// Instance name
        #[arg(short, long)]
        name: Option<String>,

        /// User starting the instance
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Initial context data as a JSON object
        #[arg(short, long)]
        context: Option<String>,

        /// Print prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },

    /// Show an instance with its step executions and context
    Status {
        instance_id: String,
    },

    /// Instance and step statistics across the store
    Stats {
        /// Only instances of this definition
        #[arg(short, long)]
        definition: Option<String>,
    },
}

fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    // YAML is a superset of JSON, one parser covers both
    let definition = WorkflowDefinition::from_yaml(&document)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    Ok(definition)
}

fn parse_context(raw: Option<&str>) -> Result<HashMap<String, Value>> {
    match raw {
        None => Ok(HashMap::new()),
        Some(raw) => {
            serde_json::from_str(raw).context("--context must be a JSON object")
        }
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    let store = create_store(&config.database).await?;
    store.init().await?;
    Ok(store)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn validate(file: &Path) -> Result<()> {
    let definition = load_definition(file)?;
    definition.validate()?;

    for step in definition.dead_ends() {
        warn!(
            "Step {} ({}) has no outgoing transition; instances reaching it will fail",
            step.id, step.step_type
        );
    }

    println!(
        "{} (id {}, version {}): {} steps, {} transitions",
        definition.name,
        definition.id,
        definition.version,
        definition.steps.len(),
        definition.transitions.len()
    );
    Ok(())
}

async fn run(
    config: Config,
    file: &Path,
    name: Option<String>,
    user: &str,
    context: Option<&str>,
    show_metrics: bool,
) -> Result<()> {
    let definition = load_definition(file)?;
    let initial_context = parse_context(context)?;
    let name = name.unwrap_or_else(|| definition.name.clone());

    let store = open_store(&config).await?;
    let definition_id = definition.id.clone();
    store.save_definition(definition).await?;

    let engine = Arc::new(WorkflowEngine::new(
        store.clone(),
        Arc::new(StaticAgentAssigner::new(config.engine.default_agent_id.clone())),
        Arc::new(StepExecutor::new()),
        config.engine.clone(),
    ));
    engine.clone().start().await;

    let instance = engine
        .start_workflow(&definition_id, &name, user, initial_context)
        .await?;
    info!("Started workflow instance {}", instance.id);
    engine.wait_for_idle(&instance.id).await?;

    print_instance(store.as_ref(), &instance.id).await?;

    if show_metrics {
        print!("{}", metrics::gather_metrics()?);
    }
    Ok(())
}

async fn print_instance(store: &dyn Store, instance_id: &str) -> Result<()> {
    let Some(instance) = store.get_instance(instance_id).await? else {
        bail!("Workflow instance not found: {}", instance_id);
    };
    let steps = store.list_step_executions(instance_id).await?;
    let context = store.get_execution_context(instance_id).await?;

    print_json(&json!({
        "instance": instance,
        "steps": steps,
        "context": context,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging, RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("workflow_engine={},warn", cli.log_level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { file } => validate(&file).await?,
        Commands::Run {
            file,
            name,
            user,
            context,
            metrics,
        } => {
            let config = Config::load()?;
            run(config, &file, name, &user, context.as_deref(), metrics).await?
        }
        Commands::Status { instance_id } => {
            let config = Config::load()?;
            if config.database.db_type == DatabaseType::Memory {
                warn!("DATABASE_TYPE is memory; nothing persists between invocations");
            }
            let store = open_store(&config).await?;
            print_instance(store.as_ref(), &instance_id).await?
        }
        Commands::Stats { definition } => {
            let config = Config::load()?;
            let store = open_store(&config).await?;
            let monitor = WorkflowMonitor::new(store);
            let stats = match definition {
                Some(id) => monitor.statistics_for_definition(&id).await?,
                None => monitor.statistics().await?,
            };
            print_json(&serde_json::to_value(stats)?)?
        }
    }

    Ok(())
}
