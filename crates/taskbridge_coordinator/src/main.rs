//! Taskbridge Coordinator
//!
//! Usage:
//!     taskbridge-coordinator --port 8765 --shared-secret <secret>

use anyhow::Result;
use clap::Parser;
use taskbridge_coordinator::config::{parse_id_list, CoordinatorConfig};
use taskbridge_coordinator::{Coordinator, CoordinatorEvent, CoordinatorHandle, EventReceiver};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "taskbridge-coordinator", about = "Control plane for taskbridge workers")]
struct Args {
    /// Transport listen port for worker connections
    #[arg(long, env = "TASKBRIDGE_PORT", default_value_t = 8765)]
    port: u16,

    /// Shared secret workers must present at registration
    #[arg(long, env = "TASKBRIDGE_SHARED_SECRET")]
    shared_secret: String,

    /// Chat-service bot token (consumed by the chat adapter)
    #[arg(long, env = "TASKBRIDGE_CHAT_TOKEN", default_value = "")]
    chat_token: String,

    /// Chat-service guild id
    #[arg(long, env = "TASKBRIDGE_GUILD_ID", default_value = "")]
    guild_id: String,

    /// Comma-separated user ids allowed to drive tasks
    #[arg(long, env = "TASKBRIDGE_ALLOWED_USERS", default_value = "")]
    allowed_users: String,

    /// Channel id for task status embeds
    #[arg(long, env = "TASKBRIDGE_CHANNEL_TASKS")]
    channel_tasks: Option<String>,

    /// Channel id for worker connect/disconnect notices
    #[arg(long, env = "TASKBRIDGE_CHANNEL_WORKERS")]
    channel_workers: Option<String>,

    /// Channel id for token-accounting summaries
    #[arg(long, env = "TASKBRIDGE_CHANNEL_TOKENS")]
    channel_tokens: Option<String>,

    /// Channel id for team-mode observations
    #[arg(long, env = "TASKBRIDGE_CHANNEL_TEAMS")]
    channel_teams: Option<String>,

    /// Channel id for scheduled-task output
    #[arg(long, env = "TASKBRIDGE_CHANNEL_SCHEDULED")]
    channel_scheduled: Option<String>,

    /// Log filter override (e.g. "debug")
    #[arg(long, env = "TASKBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    taskbridge_logging::init_logging("taskbridge-coordinator", args.log_level.as_deref())?;

    let config = CoordinatorConfig {
        shared_secret: args.shared_secret,
        port: args.port,
        chat_token: args.chat_token,
        guild_id: args.guild_id,
        allowed_user_ids: parse_id_list(&args.allowed_users),
        task_status_channel: args.channel_tasks,
        worker_notification_channel: args.channel_workers,
        token_usage_channel: args.channel_tokens,
        teams_channel: args.channel_teams,
        scheduled_output_channel: args.channel_scheduled,
        state_dir: taskbridge_logging::taskbridge_home(),
    };

    info!("Starting taskbridge coordinator");
    info!("  Port: {}", config.port);
    info!("  Allowed users: {}", config.allowed_user_ids.len());

    let (mut coordinator, handle, events) = Coordinator::new(config.shared_secret.clone());

    let server_commands = handle.command_sender();
    let server = tokio::spawn(async move {
        if let Err(e) = taskbridge_coordinator::server::run_server(config.port, server_commands).await {
            warn!("Transport server stopped: {}", e);
        }
    });

    // The chat adapter consumes these events in production; log them here so
    // lifecycle transitions are visible without one attached.
    tokio::spawn(log_events(events));

    let shutdown_handle: CoordinatorHandle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            shutdown_handle.shutdown();
        }
    });

    coordinator.run().await?;
    server.abort();
    Ok(())
}

async fn log_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            CoordinatorEvent::TaskQueued { task } => info!("Task {} queued", task.id),
            CoordinatorEvent::TaskStarted { task } => info!(
                "Task {} started on {}",
                task.id,
                task.worker_id.as_deref().unwrap_or("?")
            ),
            CoordinatorEvent::TaskStreamUpdate { task } => {
                info!("Task {} update: {} tools, {} chars", task.id, task.tool_history.len(), task.result_text.len())
            }
            CoordinatorEvent::TaskCompleted { task } => info!("Task {} completed", task.id),
            CoordinatorEvent::TaskFailed { task } => warn!(
                "Task {} failed: {}",
                task.id,
                task.error_message.as_deref().unwrap_or("unknown")
            ),
            CoordinatorEvent::TaskCancelled { task } => info!("Task {} cancelled", task.id),
            CoordinatorEvent::TaskQuestion { task_id, payload } => {
                info!("Task {} asks: {}", task_id, payload.question)
            }
            CoordinatorEvent::TaskPermission { task_id, payload } => {
                info!("Task {} requests permission for {}", task_id, payload.tool)
            }
            CoordinatorEvent::WorkerConnected { worker } => {
                info!("Worker '{}' connected ({})", worker.name, worker.os)
            }
            CoordinatorEvent::WorkerDisconnected { worker_id, had_running_task } => {
                warn!("Worker '{}' disconnected (running task: {})", worker_id, had_running_task)
            }
            CoordinatorEvent::TeamUpdate { worker_id, .. } => {
                info!("Team update from '{}'", worker_id)
            }
        }
    }
}
