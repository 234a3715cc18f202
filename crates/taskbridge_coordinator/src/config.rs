//! Coordinator configuration (plain data, environment-driven).

use std::path::PathBuf;

/// Everything the coordinator process needs at startup. Built from CLI
/// flags with environment fallbacks; the chat-surface fields are passed
/// through to the adapter untouched.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Shared secret workers must present at registration.
    pub shared_secret: String,
    /// Transport listen port.
    pub port: u16,
    /// Chat-service bot token.
    pub chat_token: String,
    /// Chat-service guild id.
    pub guild_id: String,
    /// User ids allowed to drive tasks.
    pub allowed_user_ids: Vec<String>,
    /// Channel for task status embeds.
    pub task_status_channel: Option<String>,
    /// Channel for worker connect/disconnect notices.
    pub worker_notification_channel: Option<String>,
    /// Channel for token-accounting summaries.
    pub token_usage_channel: Option<String>,
    /// Channel for team-mode observations.
    pub teams_channel: Option<String>,
    /// Channel for scheduled-task output.
    pub scheduled_output_channel: Option<String>,
    /// Where alias/schedule JSON files live.
    pub state_dir: PathBuf,
}

/// Parse a comma-separated id list, ignoring empty entries.
pub fn parse_id_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
