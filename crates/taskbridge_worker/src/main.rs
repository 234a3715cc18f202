//! Taskbridge Worker
//!
//! Usage:
//!     taskbridge-worker --coordinator-url ws://coordinator:8765 --shared-secret <secret>

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use taskbridge_worker::worker::{self, WorkerConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "taskbridge-worker", about = "Assistant-CLI execution node for taskbridge")]
struct Args {
    /// Coordinator WebSocket URL
    #[arg(long, env = "TASKBRIDGE_COORDINATOR_URL", default_value = "ws://127.0.0.1:8765")]
    coordinator_url: String,

    /// Shared secret presented at registration
    #[arg(long, env = "TASKBRIDGE_SHARED_SECRET")]
    shared_secret: String,

    /// Worker name (auto-generated if not provided)
    #[arg(long, env = "TASKBRIDGE_WORKER_NAME")]
    name: Option<String>,

    /// Assistant CLI program to spawn
    #[arg(long, env = "TASKBRIDGE_CLI", default_value = "claude")]
    cli: String,

    /// Default working directory for tasks
    #[arg(long, env = "TASKBRIDGE_DEFAULT_CWD", default_value = ".")]
    cwd: PathBuf,

    /// Comma-separated directories accepted as a task cwd (empty: any)
    #[arg(long, env = "TASKBRIDGE_ALLOWED_DIRS", default_value = "")]
    allowed_dirs: String,

    /// Log filter override (e.g. "debug")
    #[arg(long, env = "TASKBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    taskbridge_logging::init_logging("taskbridge-worker", args.log_level.as_deref())?;

    let name = args.name.unwrap_or_else(|| {
        let tag = uuid::Uuid::new_v4().to_string();
        format!("worker-{}", tag.split('-').next().unwrap_or("0"))
    });
    let allowed_dirs: Vec<PathBuf> = args
        .allowed_dirs
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(PathBuf::from)
        .collect();

    let config = WorkerConfig {
        coordinator_url: args.coordinator_url.clone(),
        shared_secret: args.shared_secret,
        name: name.clone(),
        cli_command: args.cli.clone(),
        default_cwd: args.cwd.clone(),
        allowed_dirs,
    };

    info!("Starting taskbridge worker");
    info!("  Coordinator: {}", args.coordinator_url);
    info!("  Worker name: {}", name);
    info!("  CLI: {}", args.cli);
    info!("  Default cwd: {}", args.cwd.display());

    worker::run(config).await
}
