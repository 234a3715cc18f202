//! Control-plane protocol between Coordinator and Workers.
//!
//! Every message travels as one UTF-8 JSON text frame carrying a uniform
//! envelope:
//!
//! ```text
//! { "type": <tag>, "payload": <shape determined by tag>,
//!   "timestamp": <ms since epoch>,
//!   "taskId"?: <string>, "workerId"?: <string> }
//! ```
//!
//! Decoders reject envelopes missing `type`, `payload`, or `timestamp`.
//! A `payload` of `null` is a present payload and is accepted.

pub mod defaults;
pub mod error;
pub mod types;

// Re-export types for convenience
pub use types::{
    AnswerPayload,
    AttachmentMeta,
    FileTransferAck,
    FileTransferPayload,
    HeartbeatAck,
    HeartbeatPayload,
    PermissionMode,
    PermissionRequestPayload,
    PermissionResponsePayload,
    RegisterAck,
    RegisterPayload,
    StreamEvent,
    TaskAssignPayload,
    TaskCancelPayload,
    TaskCompletePayload,
    TaskErrorPayload,
    TaskQuestionPayload,
    TaskStatus,
    TokenUsage,
    WorkerStatus,
};

pub use error::ProtocolError;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Semver protocol version. Mismatch at handshake is reported back in the
/// register ack and logged, never fatal.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Message tags carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Worker -> Coordinator (handshake)
    #[serde(rename = "worker:register")]
    WorkerRegister,
    // Coordinator -> Worker
    #[serde(rename = "worker:register_ack")]
    WorkerRegisterAck,
    // Worker -> Coordinator (keep-alive)
    #[serde(rename = "worker:heartbeat")]
    WorkerHeartbeat,
    #[serde(rename = "worker:heartbeat_ack")]
    WorkerHeartbeatAck,
    // Coordinator -> Worker (start a task)
    #[serde(rename = "task:assign")]
    TaskAssign,
    // Worker -> Coordinator (incremental parser event)
    #[serde(rename = "task:stream")]
    TaskStream,
    // Worker -> Coordinator (terminal success)
    #[serde(rename = "task:complete")]
    TaskComplete,
    // Worker -> Coordinator (terminal failure)
    #[serde(rename = "task:error")]
    TaskError,
    // Coordinator -> Worker (request abort)
    #[serde(rename = "task:cancel")]
    TaskCancel,
    // Out-of-band user-facing question
    #[serde(rename = "task:question")]
    TaskQuestion,
    #[serde(rename = "task:answer")]
    TaskAnswer,
    // Tool-use authorisation
    #[serde(rename = "task:permission")]
    TaskPermission,
    #[serde(rename = "task:permission_response")]
    TaskPermissionResponse,
    // Out-of-band attachment delivery before task:assign
    #[serde(rename = "file:transfer")]
    FileTransfer,
    #[serde(rename = "file:transfer_ack")]
    FileTransferAck,
    // Worker -> Coordinator (auxiliary team-state observation)
    #[serde(rename = "team:update")]
    TeamUpdate,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::WorkerRegister => "worker:register",
            MessageType::WorkerRegisterAck => "worker:register_ack",
            MessageType::WorkerHeartbeat => "worker:heartbeat",
            MessageType::WorkerHeartbeatAck => "worker:heartbeat_ack",
            MessageType::TaskAssign => "task:assign",
            MessageType::TaskStream => "task:stream",
            MessageType::TaskComplete => "task:complete",
            MessageType::TaskError => "task:error",
            MessageType::TaskCancel => "task:cancel",
            MessageType::TaskQuestion => "task:question",
            MessageType::TaskAnswer => "task:answer",
            MessageType::TaskPermission => "task:permission",
            MessageType::TaskPermissionResponse => "task:permission_response",
            MessageType::FileTransfer => "file:transfer",
            MessageType::FileTransferAck => "file:transfer_ack",
            MessageType::TeamUpdate => "team:update",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker:register" => Ok(MessageType::WorkerRegister),
            "worker:register_ack" => Ok(MessageType::WorkerRegisterAck),
            "worker:heartbeat" => Ok(MessageType::WorkerHeartbeat),
            "worker:heartbeat_ack" => Ok(MessageType::WorkerHeartbeatAck),
            "task:assign" => Ok(MessageType::TaskAssign),
            "task:stream" => Ok(MessageType::TaskStream),
            "task:complete" => Ok(MessageType::TaskComplete),
            "task:error" => Ok(MessageType::TaskError),
            "task:cancel" => Ok(MessageType::TaskCancel),
            "task:question" => Ok(MessageType::TaskQuestion),
            "task:answer" => Ok(MessageType::TaskAnswer),
            "task:permission" => Ok(MessageType::TaskPermission),
            "task:permission_response" => Ok(MessageType::TaskPermissionResponse),
            "file:transfer" => Ok(MessageType::FileTransfer),
            "file:transfer_ack" => Ok(MessageType::FileTransferAck),
            "team:update" => Ok(MessageType::TeamUpdate),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

/// Uniform wrapper for every control-plane message.
///
/// `payload` is kept as raw JSON here; the tag determines the concrete shape
/// and each handler decodes it with [`Envelope::payload_as`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none", default)]
    pub task_id: Option<String>,
    #[serde(rename = "workerId", skip_serializing_if = "Option::is_none", default)]
    pub worker_id: Option<String>,
}

impl Envelope {
    /// Build an envelope with the current wall-clock timestamp.
    pub fn new<T: Serialize>(message_type: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        Ok(Self {
            message_type,
            payload: serde_json::to_value(payload)?,
            timestamp: chrono::Utc::now().timestamp_millis(),
            task_id: None,
            worker_id: None,
        })
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    /// Serialise to the single-frame JSON text format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a frame. Rejects envelopes missing `type`, `payload`, or
    /// `timestamp` (a literal `null` payload is present and accepted).
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Decode the payload into its tag-specific shape.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}
