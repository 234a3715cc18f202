//! Task model owned by the task manager.
//!
//! Tasks are kept in memory for the life of the coordinator process; nothing
//! here is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use taskbridge_protocol::types::{AttachmentMeta, PermissionMode, TaskStatus, TokenUsage};

/// Status of one entry in a task's tool history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Completed,
    Error,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Running => "running",
            ToolStatus::Completed => "completed",
            ToolStatus::Error => "error",
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One tool invocation observed on the stream, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolHistoryEntry {
    pub tool: String,
    pub summary: String,
    pub status: ToolStatus,
    pub timestamp: DateTime<Utc>,
}

/// Everything needed to admit a task. Built by the chat adapter; the
/// working directory must already be alias-resolved.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub prompt: String,
    pub cwd: Option<String>,
    pub permission_mode: PermissionMode,
    pub team_mode: bool,
    pub continue_session: bool,
    /// Session to resume when `continue_session` is set.
    pub session_id: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    /// Dispatch hint; falls back to round-robin when absent or offline.
    pub preferred_worker: Option<String>,
    /// Opaque chat-surface identifiers, carried through callbacks.
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub requester_id: Option<String>,
}

/// One invocation of the assistant CLI and its aggregated lifecycle state.
///
/// Mutated only by the task manager. Exactly one terminal transition;
/// `worker_id` is set iff the task was assigned; `started_at` is set exactly
/// when entering Running and `completed_at` exactly on the terminal
/// transition.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub cwd: Option<String>,
    pub permission_mode: PermissionMode,
    pub team_mode: bool,
    pub continue_session: bool,
    pub session_id: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
    pub preferred_worker: Option<String>,
    pub tool_history: Vec<ToolHistoryEntry>,
    pub result_text: String,
    pub error_message: Option<String>,
    pub usage: TokenUsage,
    pub message_id: Option<String>,
    pub thread_id: Option<String>,
    pub requester_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: String, options: TaskOptions) -> Self {
        Self {
            id,
            prompt: options.prompt,
            status: TaskStatus::Queued,
            worker_id: None,
            cwd: options.cwd,
            permission_mode: options.permission_mode,
            team_mode: options.team_mode,
            continue_session: options.continue_session,
            session_id: options.session_id,
            attachments: options.attachments,
            preferred_worker: options.preferred_worker,
            tool_history: Vec::new(),
            result_text: String::new(),
            error_message: None,
            usage: TokenUsage::default(),
            message_id: options.message_id,
            thread_id: options.thread_id,
            requester_id: options.requester_id,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Close the most recent `running` entry for `tool`, scanning backward.
    /// Out-of-order ends for interleaved tools resolve to the right entry
    /// because begins are appended in stream order.
    pub fn close_tool_entry(&mut self, tool: &str, summary: String, success: bool) -> bool {
        for entry in self.tool_history.iter_mut().rev() {
            if entry.status == ToolStatus::Running && entry.tool == tool {
                entry.summary = summary;
                entry.status = if success {
                    ToolStatus::Completed
                } else {
                    ToolStatus::Error
                };
                return true;
            }
        }
        false
    }
}

/// Continuation bookkeeping: retained for every completed task whose CLI
/// returned a session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub task_id: String,
    pub prompt: String,
    pub worker_id: Option<String>,
    pub cwd: Option<String>,
    pub session_id: String,
}
