use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tracing::Level;

use conductor_engine::{Conductor, EngineConfig, ToolRegistry};
use conductor_llm::{OpenAiGateway, ReliableGateway};
use conductor_server::ServerConfig;
use conductor_store::{Database, HistoryRepo, RunRepo};
use conductor_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-agent coding orchestrator", long_about = None)]
struct Cli {
    /// Port to listen on (0 picks a free one)
    #[arg(long, default_value_t = 9091)]
    port: u16,

    /// SQLite database for runs, events and history
    #[arg(long)]
    db: Option<PathBuf>,

    /// Directory the tools operate in (default: current directory)
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    #[arg(long, default_value_t = 4)]
    max_workers: u32,

    #[arg(long, default_value_t = 5)]
    max_rounds: u32,

    /// Seconds before an unfinished worker is reported as timed out
    #[arg(long, default_value_t = 300)]
    worker_timeout: u64,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    log_json: bool,

    /// Let the coder model decide whether a request needs the orchestrator
    #[arg(long)]
    routing: bool,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = data_dir();
    std::fs::create_dir_all(&data_dir).with_context(|| format!("creating {}", data_dir.display()))?;

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: Level::INFO,
        module_levels: Vec::new(),
        json: cli.log_json,
        metrics_db_path: Some(data_dir.join("metrics.db")),
    });
    let metrics = telemetry.metrics();

    let db_path = cli.db.clone().unwrap_or_else(|| data_dir.join("conductor.db"));
    let db = Database::open(&db_path).with_context(|| format!("opening database {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");
    RunRepo::new(db.clone())
        .fail_interrupted("server restarted before the run finished")
        .context("closing interrupted runs")?;

    let workspace_root = match cli.workspace_root {
        Some(root) => root,
        None => std::env::current_dir().context("resolving current directory")?,
    };

    let config = EngineConfig {
        max_workers: cli.max_workers.max(1),
        max_rounds: cli.max_rounds.max(1),
        worker_timeout: Duration::from_secs(cli.worker_timeout),
        routing_enabled: cli.routing,
        ..Default::default()
    };

    let api_key = cli.openai_api_key.map(SecretString::from);
    if api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY is not set, only the ollama provider will work");
    }
    let gateway = ReliableGateway::with_defaults(OpenAiGateway::with_defaults(api_key)?).with_metrics(Arc::clone(&metrics));

    let tools = Arc::new(ToolRegistry::with_builtins(&workspace_root, &config));
    let history = Arc::new(HistoryRepo::new(db.clone()));
    let conductor = Arc::new(
        Conductor::new(config, Arc::new(gateway), Arc::clone(&tools) as _, history).with_metrics(Arc::clone(&metrics)),
    );
    tracing::info!(root = %workspace_root.display(), tools = ?tools.names(), "engine ready");

    let server_config = ServerConfig {
        port: cli.port,
        ..Default::default()
    };
    let handle = conductor_server::start(server_config, db, conductor, tools, Some(Arc::clone(&metrics)))
        .await
        .context("starting server")?;
    tracing::info!(port = handle.port, "conductor ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;

    let aborted = handle.shutdown();
    if let Err(e) = metrics.snapshot() {
        tracing::warn!(error = %e, "failed to persist metrics snapshot");
    }
    tracing::info!(aborted, "shutting down");
    Ok(())
}

fn data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".conductor")
}
