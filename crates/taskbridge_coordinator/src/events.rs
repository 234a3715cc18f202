//! Typed events emitted toward the chat adapter.
//!
//! The adapter (and any other subscriber, e.g. a token tracker) consumes
//! these from an unbounded channel; each lifecycle transition produces
//! exactly one event, emitted from the coordinator task that performed the
//! transition. Stream updates are throttled to one per second per task.

use crate::registry::WorkerInfo;
use crate::task::Task;
use taskbridge_protocol::types::{PermissionRequestPayload, TaskQuestionPayload};

#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    TaskQueued { task: Task },
    TaskStarted { task: Task },
    /// Throttled; carries the latest aggregated state.
    TaskStreamUpdate { task: Task },
    TaskCompleted { task: Task },
    TaskFailed { task: Task },
    TaskCancelled { task: Task },
    TaskQuestion {
        task_id: String,
        payload: TaskQuestionPayload,
    },
    TaskPermission {
        task_id: String,
        payload: PermissionRequestPayload,
    },
    WorkerConnected { worker: WorkerInfo },
    WorkerDisconnected {
        worker_id: String,
        had_running_task: bool,
    },
    /// Auxiliary team-state observation, forwarded verbatim.
    TeamUpdate {
        worker_id: String,
        payload: serde_json::Value,
    },
}

pub type EventSender = tokio::sync::mpsc::UnboundedSender<CoordinatorEvent>;
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<CoordinatorEvent>;

/// Fire an event, ignoring a dropped subscriber: the core keeps running
/// even when nothing is listening.
pub fn emit(sender: &EventSender, event: CoordinatorEvent) {
    let _ = sender.send(event);
}
