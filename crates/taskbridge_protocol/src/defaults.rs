//! Canonical operational constants shared by Coordinator and Worker.
//!
//! These values are part of the wire contract; changing any of them breaks
//! compatibility with deployed peers.

/// Worker heartbeat send interval.
pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Coordinator-side watchdog: a worker silent for 2x the heartbeat interval
/// is treated as disconnected.
pub const HEARTBEAT_TIMEOUT_MS: u64 = 60_000;

/// Worker reconnect backoff: base delay, doubling per attempt up to the cap,
/// with +/-20% jitter applied to each delay.
pub const RECONNECT_BASE_MS: u64 = 1_000;
pub const RECONNECT_MAX_MS: u64 = 60_000;
pub const RECONNECT_JITTER: f64 = 0.2;

/// Default per-task timeout, enforced independently on both sides.
pub const TASK_TIMEOUT_MS: u64 = 600_000;

/// Queue admission cap; the 51st enqueue is rejected.
pub const QUEUE_CAPACITY: usize = 50;

/// Chat surface caps. Long outputs spill to secondary thread messages.
pub const CHAT_MESSAGE_CAP: usize = 2_000;
pub const EMBED_FIELD_CAP: usize = 4_096;

/// Prompt preview length in chat embeds.
pub const PROMPT_DISPLAY_CAP: usize = 200;

/// Minimum interval between chat stream-update callbacks per task.
pub const STREAM_THROTTLE_MS: u64 = 1_000;

/// Attachments above this size are rejected at admission.
pub const ATTACHMENT_MAX_BYTES: u64 = 8 * 1024 * 1024;

/// Overall per-task budget for the attachment fetch-and-transfer step.
pub const TRANSFER_BUDGET_MS: u64 = 10_000;

/// A connection must complete an authenticated register within this window.
pub const AUTH_TIMEOUT_MS: u64 = 10_000;

/// Grace period between SIGTERM and SIGKILL when stopping the assistant CLI.
pub const KILL_GRACE_MS: u64 = 5_000;
