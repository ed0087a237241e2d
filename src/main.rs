use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use trellis_core::config::AppConfig;
use trellis_core::event::EventBus;
use trellis_core::graph::{validate, Graph};
use trellis_core::state::ExecutionState;
use trellis_core::types::RunId;

use trellis_engine::{Dispatcher, HandlerRegistry, RunOutcome, Stepper};
use trellis_gateway::GatewayServer;
use trellis_store::SqliteStore;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Durable workflow orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "trellis.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway and worker pool
    Serve,
    /// Execute a workflow definition file once and print the final data
    Run {
        /// Path to a workflow definition (JSON)
        file: PathBuf,
        /// Initial input payload (JSON object)
        #[arg(long, default_value = "{}")]
        input: String,
    },
    /// Check a workflow definition file without running it
    Validate {
        /// Path to a workflow definition (JSON)
        file: PathBuf,
    },
    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("trellis=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Run { file, input } => run_once(config, &file, &input).await,
        Commands::Validate { file } => validate_file(&file),
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(std::path::Path::new(
        &config.storage.db_path,
    ))?);
    let events = Arc::new(EventBus::default());
    let registry = Arc::new(HandlerRegistry::new());

    let cancel = tokio_util::sync::CancellationToken::new();
    let dispatcher = Dispatcher::new(
        store.clone(),
        registry,
        events.clone(),
        config.engine.clone(),
        cancel.clone(),
    );
    let handle = dispatcher.handle();
    let dispatcher_task = tokio::spawn(dispatcher.run());

    // Runs the previous process left behind — queued, or claimed by a worker
    // that never finished — go back on the queue and resume from their last
    // checkpoint. Duplicate deliveries are dropped by the claim CAS.
    trellis_engine::recover_stranded_runs(&store, &handle).await?;

    let server = GatewayServer::new(config.gateway.clone(), store, events, handle);

    // Graceful shutdown on Ctrl-C
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down gateway...");
        cancel_clone.cancel();
    });

    server.run(cancel.clone()).await?;

    cancel.cancel();
    dispatcher_task.await.ok();
    Ok(())
}

async fn run_once(config: AppConfig, file: &PathBuf, input: &str) -> anyhow::Result<()> {
    let graph: Graph = serde_json::from_str(&std::fs::read_to_string(file)?)?;
    let report = validate(&graph);
    for warning in &report.warnings {
        warn!(workflow = %graph.name, "{warning}");
    }
    if !report.is_valid() {
        anyhow::bail!("invalid workflow: {}", report.errors.join("; "));
    }

    let input: serde_json::Value = serde_json::from_str(input)?;
    let store = Arc::new(SqliteStore::in_memory()?);
    let stepper = Stepper::new(
        graph.clone(),
        store,
        Arc::new(HandlerRegistry::new()),
        Arc::new(EventBus::default()),
        config.engine.max_iterations,
    );

    let mut state = ExecutionState::new(RunId::new(), graph.entry.clone(), input);
    let cancel = tokio_util::sync::CancellationToken::new();
    match stepper.run_to_boundary(&mut state, &cancel).await? {
        RunOutcome::Completed => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::Value::Object(state.data))?
            );
            Ok(())
        }
        RunOutcome::Suspended { node_id, .. } => {
            anyhow::bail!(
                "workflow parked at approval node '{node_id}'; approval gates need `trellis serve`"
            )
        }
    }
}

fn validate_file(file: &PathBuf) -> anyhow::Result<()> {
    let graph: Graph = serde_json::from_str(&std::fs::read_to_string(file)?)?;
    let report = validate(&graph);
    for warning in &report.warnings {
        println!("warning: {warning}");
    }
    if report.is_valid() {
        println!(
            "workflow '{}' is valid ({} nodes, {} edges)",
            graph.name,
            graph.nodes.len(),
            graph.edges.len()
        );
        Ok(())
    } else {
        for error in &report.errors {
            eprintln!("error: {error}");
        }
        anyhow::bail!("workflow '{}' failed validation", graph.name)
    }
}
