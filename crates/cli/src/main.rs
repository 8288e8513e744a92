//! `dagflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`: run a master (event engine, failover, timeouts) and its API.
//! - `validate`: validate a workflow definition JSON file.

mod workers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use db::models::WorkflowDefinition;
use db::MemoryStore;
use engine::{LogAlertSender, MasterConfig, MasterDeps, MasterServer};
use registry::{MemoryRegistry, NodeType};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use workers::SimulatedWorkers;

#[derive(Parser)]
#[command(name = "dagflow", about = "Distributed workflow scheduler master", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a master with in-process store, registry and workers.
    ///
    /// The workers accept every task. Task results are reported through
    /// `POST /api/v1/task-events`, or by the workers themselves when
    /// `--simulated-task-ms` is set.
    Serve(ServeArgs),
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow definition JSON file.
        path: PathBuf,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "DAGFLOW_BIND", default_value = "0.0.0.0:8080")]
    bind: String,
    /// Address this master registers under.
    #[arg(long, env = "DAGFLOW_MASTER_HOST", default_value = "127.0.0.1:5678")]
    host: String,
    /// Host reported for every task the simulated workers accept.
    #[arg(long, env = "DAGFLOW_WORKER_HOST", default_value = "127.0.0.1:1234")]
    worker_host: String,
    #[arg(long, env = "DAGFLOW_TICK_INTERVAL_MS", default_value_t = 100)]
    tick_interval_ms: u64,
    #[arg(long, env = "DAGFLOW_FAILOVER_INTERVAL_SECS", default_value_t = 10)]
    failover_interval_secs: u64,
    #[arg(long, env = "DAGFLOW_TIMEOUT_CHECK_INTERVAL_SECS", default_value_t = 30)]
    timeout_check_interval_secs: u64,
    /// Let the simulated workers finish every task successfully after this
    /// many milliseconds.
    #[arg(long, env = "DAGFLOW_SIMULATED_TASK_MS")]
    simulated_task_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Validate { path } => validate(&path),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = MasterConfig {
        tick_interval: Duration::from_millis(args.tick_interval_ms),
        failover_interval: Duration::from_secs(args.failover_interval_secs),
        timeout_check_interval: Duration::from_secs(args.timeout_check_interval_secs),
        ..MasterConfig::with_host(args.host.clone())
    };

    let registry = MemoryRegistry::new(args.host.clone());
    registry.register_server(&args.host, NodeType::Master, Utc::now());
    registry.register_server(&args.worker_host, NodeType::Worker, Utc::now());

    let run_for = args.simulated_task_ms.map(Duration::from_millis);
    let (executor, instructions) = match run_for {
        Some(_) => {
            let (executor, instructions) = SimulatedWorkers::reporting(args.worker_host.clone());
            (executor, Some(instructions))
        }
        None => (SimulatedWorkers::accepting(args.worker_host.clone()), None),
    };

    let master = MasterServer::start(
        config,
        MasterDeps {
            store: Arc::new(MemoryStore::new()),
            registry: Arc::new(registry),
            executor: Arc::new(executor),
            alerts: Arc::new(LogAlertSender),
        },
    )?;

    if let (Some(instructions), Some(run_for)) = (instructions, run_for) {
        info!(?run_for, "simulated workers report task results");
        tokio::spawn(workers::report_results(
            master.coordinator(),
            instructions,
            args.worker_host,
            run_for,
        ));
    }

    info!("Starting API server on {}", args.bind);
    let state = api::AppState {
        coordinator: master.coordinator(),
    };
    let served = api::serve(&args.bind, state, shutdown_signal()).await;
    master.shutdown().await;
    served.with_context(|| format!("api server on {} failed", args.bind))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for ctrl-c, serving until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let definition: WorkflowDefinition =
        serde_json::from_str(&content).context("invalid workflow definition JSON")?;

    match engine::validate_dag(&definition) {
        Ok(order) => {
            println!(
                "✅ Workflow {} v{} is valid. Topological order: {order:?}",
                definition.name, definition.version
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Validation failed: {e}");
            std::process::exit(1);
        }
    }
}
