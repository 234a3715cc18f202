//! Protocol payload types.
//!
//! One struct per message tag, plus the canonical enums and the typed stream
//! events shared by the worker's parser and the coordinator's task manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// Task lifecycle status on the Coordinator.
/// This is the CANONICAL definition - use this everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task admitted, waiting for a worker
    #[default]
    Queued,
    /// Task assigned and executing on a worker
    Running,
    /// Task finished successfully
    Completed,
    /// Task finished with an error
    Failed,
    /// Task aborted before completion
    Cancelled,
}

impl TaskStatus {
    pub const ALL: &'static [TaskStatus] = &[
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" | "canceled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Invalid task status: '{}'", s)),
        }
    }
}

/// Worker availability as tracked by the registry.
/// Offline is only transient during deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Connected and free to take a task
    #[default]
    Online,
    /// Connected and running a task
    Busy,
    /// Being removed from the registry
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Online => "online",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, WorkerStatus::Online)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "online" => Ok(WorkerStatus::Online),
            "busy" => Ok(WorkerStatus::Busy),
            "offline" => Ok(WorkerStatus::Offline),
            _ => Err(format!("Invalid worker status: '{}'", s)),
        }
    }
}

/// How the assistant CLI handles tool-use authorisation for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// File edits are pre-approved; everything else prompts
    AcceptEdits,
    /// All permission prompts are skipped
    Auto,
    /// Every tool use asks first
    #[default]
    Confirm,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Auto => "auto",
            PermissionMode::Confirm => "confirm",
        }
    }
}

impl fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "auto" => Ok(PermissionMode::Auto),
            "confirm" => Ok(PermissionMode::Confirm),
            _ => Err(format!(
                "Invalid permission mode: '{}'. Expected: acceptEdits, auto, or confirm",
                s
            )),
        }
    }
}

// ============================================================================
// Token usage
// ============================================================================

/// Cumulative token counters for one task.
///
/// The worker always reports cumulative values, so consumers overwrite
/// rather than add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.input == 0 && self.output == 0 && self.cache_read == 0 && self.cache_write == 0
    }

    /// Component-wise sum, used when aggregating per-model usage maps.
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }
}

// ============================================================================
// Stream events (Worker parser -> Coordinator task manager)
// ============================================================================

/// Typed event extracted from the assistant CLI's stream-json output.
/// Carried verbatim in `task:stream` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A text block from an assistant turn.
    AssistantMessage { text: String },
    /// A tool invocation started.
    ToolUseBegin { tool: String, summary: String },
    /// A tool invocation finished.
    ToolUseEnd {
        tool: String,
        summary: String,
        success: bool,
    },
    /// Cumulative token counters observed so far.
    TokenUsage { usage: TokenUsage },
    /// The final result record, with the continuation session handle.
    Result {
        text: String,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none", default)]
        session_id: Option<String>,
    },
    /// Rate-limit notice from the CLI.
    RateLimit { info: serde_json::Value },
    /// Error text surfaced mid-stream; a `task:error` follows.
    Error { message: String },
}

// ============================================================================
// worker:register / worker:register_ack
// ============================================================================

/// Worker -> Coordinator: authenticated handshake with capability info.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    /// Self-declared worker name; the registry key.
    pub name: String,
    pub secret: String,
    pub protocol_version: String,
    pub os: String,
    pub runtime_version: String,
    pub default_cwd: String,
    /// Directories this worker will accept as a task cwd.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_dirs: Vec<String>,
}

/// Coordinator -> Worker: handshake outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
    pub protocol_version: String,
}

// ============================================================================
// worker:heartbeat / worker:heartbeat_ack
// ============================================================================

/// Worker -> Coordinator: liveness, carrying status and current task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub status: WorkerStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatAck {}

// ============================================================================
// task:assign
// ============================================================================

/// Attachment descriptor. `local_path` is filled on the worker once the
/// bytes have been staged via `file:transfer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub local_path: Option<String>,
}

/// Coordinator -> Worker: start a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAssignPayload {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cwd: Option<String>,
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub team_mode: bool,
    /// Prior session to resume, when the task continues a conversation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentMeta>,
}

// ============================================================================
// task:complete / task:error / task:cancel
// ============================================================================

/// Worker -> Coordinator: terminal success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletePayload {
    pub result_text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Worker -> Coordinator: terminal failure. Partial output and token counts
/// are allowed to accompany the error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partial_result: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Coordinator -> Worker: request abort. Advisory; the coordinator does not
/// wait for an acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCancelPayload {
    pub reason: String,
}

// ============================================================================
// task:question / task:answer, task:permission / task:permission_response
// ============================================================================

/// Worker -> Coordinator: the assistant asked the user something.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQuestionPayload {
    pub question: String,
}

/// Coordinator -> Worker: user's answer. With the one-shot stdin contract
/// the worker only logs this; the reply arrives as a continuation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerPayload {
    pub answer: String,
}

/// Worker -> Coordinator: tool-use authorisation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequestPayload {
    pub tool: String,
    pub description: String,
}

/// Coordinator -> Worker: authorisation decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponsePayload {
    pub approved: bool,
}

// ============================================================================
// file:transfer / file:transfer_ack
// ============================================================================

/// Coordinator -> Worker: attachment bytes, base64-encoded. Correlated with
/// the ack by `(taskId, fileName)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferPayload {
    pub file_name: String,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mime_type: Option<String>,
}

/// Worker -> Coordinator: staging outcome for one attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferAck {
    pub file_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub local_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}
