//! Task lifecycle manager: admission, dispatch, stream aggregation,
//! completion/failure/cancel/timeout handling, and continuation bookkeeping.
//!
//! The manager owns every task. It collaborates with the worker registry
//! through its public methods only, and reports lifecycle transitions on the
//! event channel. Attachment delivery is handed back to the caller as
//! [`TransferJob`]s so the suspending fetch/ack work happens outside the
//! state-owning loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use taskbridge_protocol::defaults::{
    ATTACHMENT_MAX_BYTES, STREAM_THROTTLE_MS, TASK_TIMEOUT_MS,
};
use taskbridge_protocol::types::{
    FileTransferAck, StreamEvent, TaskAssignPayload, TaskCancelPayload, TaskCompletePayload,
    TaskErrorPayload, TaskStatus,
};
use taskbridge_protocol::{Envelope, MessageType};

use crate::events::{emit, CoordinatorEvent, EventSender};
use crate::queue::TaskQueue;
use crate::registry::{WorkerHandle, WorkerRegistry};
use crate::task::{SessionRecord, Task, TaskOptions, ToolHistoryEntry, ToolStatus};

/// Admission failures surfaced to the chat adapter as user-visible errors.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("task queue is full ({0} queued)")]
    QueueFull(usize),
    #[error("attachment '{0}' exceeds the 8 MiB limit")]
    AttachmentTooLarge(String),
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::QueueFull(_) => taskbridge_protocol::error::codes::QUEUE_FULL,
            AdmissionError::AttachmentTooLarge(_) => {
                taskbridge_protocol::error::codes::TRANSFER_FAILURE
            }
        }
    }
}

/// Attachment delivery work for one freshly dispatched task. The caller
/// downloads each source URL, sends `file:transfer` frames on `handle`, and
/// awaits the correlated acks, all under the 10-second per-task budget;
/// the assignment is then completed with
/// [`TaskManager::finish_dispatch`].
#[derive(Debug)]
pub struct TransferJob {
    pub task_id: String,
    pub worker_id: String,
    pub handle: Option<WorkerHandle>,
    pub attachments: Vec<taskbridge_protocol::types::AttachmentMeta>,
    pub acks: Vec<(String, oneshot::Receiver<FileTransferAck>)>,
}

#[derive(Debug, Default)]
struct ThrottleState {
    last_emit: Option<Instant>,
    trailing: Option<Instant>,
}

pub struct TaskManager {
    tasks: HashMap<String, Task>,
    queue: TaskQueue,
    sessions: Vec<SessionRecord>,
    next_id: u64,
    events: EventSender,
    /// Per-task timers, keyed by purpose so a terminal transition can tear
    /// down everything the task armed.
    timeouts: HashMap<String, Instant>,
    throttles: HashMap<String, ThrottleState>,
    pending_transfers: HashMap<(String, String), oneshot::Sender<FileTransferAck>>,
    task_timeout: Duration,
}

impl TaskManager {
    pub fn new(events: EventSender) -> Self {
        Self {
            tasks: HashMap::new(),
            queue: TaskQueue::new(),
            sessions: Vec::new(),
            next_id: 0,
            events,
            timeouts: HashMap::new(),
            throttles: HashMap::new(),
            pending_transfers: HashMap::new(),
            task_timeout: Duration::from_millis(TASK_TIMEOUT_MS),
        }
    }

    /// Override the 10-minute default, for tests.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    // ========================================================================
    // Admission & dispatch
    // ========================================================================

    /// Admit a task into the FIFO. Rejects oversize attachments and a full
    /// queue; the caller surfaces either as a user-visible error.
    pub fn create_task(&mut self, options: TaskOptions) -> Result<Task, AdmissionError> {
        for attachment in &options.attachments {
            if attachment.size_bytes > ATTACHMENT_MAX_BYTES {
                return Err(AdmissionError::AttachmentTooLarge(attachment.file_name.clone()));
            }
        }
        if self.queue.len() >= taskbridge_protocol::defaults::QUEUE_CAPACITY {
            return Err(AdmissionError::QueueFull(self.queue.len()));
        }

        self.next_id += 1;
        let id = format!("task-{}", self.next_id);
        let task = Task::new(id.clone(), options);

        self.queue.enqueue(id.clone());
        self.tasks.insert(id.clone(), task.clone());

        info!("Task {} queued", id);
        emit(&self.events, CoordinatorEvent::TaskQueued { task: task.clone() });
        Ok(task)
    }

    /// Assign queued tasks to available workers, head first. Idempotent: a
    /// no-op on an empty queue or when no worker is online. Returns the
    /// attachment-delivery work the caller must drive before the deferred
    /// `task:assign` frames go out.
    pub fn dispatch_next(&mut self, registry: &mut WorkerRegistry, now: Instant) -> Vec<TransferJob> {
        let mut jobs = Vec::new();

        loop {
            let Some(head) = self.queue.peek().map(str::to_string) else {
                break;
            };
            let preferred = self
                .tasks
                .get(&head)
                .and_then(|t| t.preferred_worker.clone());
            let Some(worker_id) = registry.available_worker(preferred.as_deref()) else {
                break;
            };

            self.queue.pop();
            let Some(task) = self.tasks.get_mut(&head) else {
                warn!("Queued task {} vanished before dispatch", head);
                continue;
            };

            task.status = TaskStatus::Running;
            task.worker_id = Some(worker_id.clone());
            task.started_at = Some(Utc::now());
            registry.mark_busy(&worker_id, &head);
            self.timeouts.insert(head.clone(), now + self.task_timeout);

            info!("Task {} running on worker {}", head, worker_id);
            let snapshot = task.clone();
            emit(&self.events, CoordinatorEvent::TaskStarted { task: snapshot });

            let needs_transfer: Vec<_> = self
                .tasks
                .get(&head)
                .map(|t| {
                    t.attachments
                        .iter()
                        .filter(|a| a.local_path.is_none())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            if needs_transfer.is_empty() {
                self.send_assign(registry, &head, &worker_id);
            } else {
                let mut acks = Vec::new();
                for attachment in &needs_transfer {
                    let (tx, rx) = oneshot::channel();
                    self.pending_transfers
                        .insert((head.clone(), attachment.file_name.clone()), tx);
                    acks.push((attachment.file_name.clone(), rx));
                }
                jobs.push(TransferJob {
                    task_id: head.clone(),
                    worker_id: worker_id.clone(),
                    handle: registry.handle_for(&worker_id),
                    attachments: needs_transfer,
                    acks,
                });
            }
        }

        jobs
    }

    /// Complete a deferred assignment once the attachment-delivery step has
    /// finished. `resolved` carries worker-local paths where staging
    /// succeeded; transfer failure is non-fatal and the task still runs.
    pub fn finish_dispatch(
        &mut self,
        registry: &mut WorkerRegistry,
        task_id: &str,
        resolved: Vec<taskbridge_protocol::types::AttachmentMeta>,
    ) {
        // Clear any transfer correlations the delivery step left behind.
        self.pending_transfers.retain(|(tid, _), _| tid != task_id);

        let Some(task) = self.tasks.get_mut(task_id) else {
            return;
        };
        if task.status != TaskStatus::Running {
            debug!("Dropping deferred assignment for {} task {}", task.status, task_id);
            return;
        }
        for meta in resolved {
            if let Some(slot) = task
                .attachments
                .iter_mut()
                .find(|a| a.file_name == meta.file_name)
            {
                slot.local_path = meta.local_path;
            }
        }
        let Some(worker_id) = task.worker_id.clone() else {
            return;
        };
        self.send_assign(registry, task_id, &worker_id);
    }

    fn send_assign(&mut self, registry: &mut WorkerRegistry, task_id: &str, worker_id: &str) {
        let Some(task) = self.tasks.get(task_id) else {
            return;
        };
        let payload = TaskAssignPayload {
            prompt: task.prompt.clone(),
            cwd: task.cwd.clone(),
            permission_mode: task.permission_mode,
            team_mode: task.team_mode,
            session_id: if task.continue_session {
                task.session_id.clone()
            } else {
                None
            },
            attachments: task.attachments.clone(),
        };
        match Envelope::new(MessageType::TaskAssign, &payload) {
            Ok(envelope) => {
                let envelope = envelope.with_task(task_id).with_worker(worker_id);
                if !registry.send_to_worker(worker_id, &envelope) {
                    warn!("task:assign for {} not delivered to {}", task_id, worker_id);
                }
            }
            Err(e) => warn!("Failed to encode task:assign for {}: {}", task_id, e),
        }
    }

    /// Resolve a `file:transfer_ack` against its `(taskId, fileName)`
    /// correlation entry.
    pub fn handle_transfer_ack(&mut self, task_id: &str, ack: FileTransferAck) {
        match self
            .pending_transfers
            .remove(&(task_id.to_string(), ack.file_name.clone()))
        {
            Some(resolver) => {
                let _ = resolver.send(ack);
            }
            None => debug!(
                "Uncorrelated file:transfer_ack for task {} file {}",
                task_id, ack.file_name
            ),
        }
    }

    // ========================================================================
    // Stream aggregation
    // ========================================================================

    /// Fold one stream event into task state. Updates for tasks not in
    /// Running are silently dropped (late events after cancel).
    pub fn on_stream(&mut self, task_id: &str, event: StreamEvent, now: Instant) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            debug!("Stream event for unknown task {}", task_id);
            return;
        };
        if task.status != TaskStatus::Running {
            debug!("Dropping stream event for {} task {}", task.status, task_id);
            return;
        }

        match event {
            StreamEvent::AssistantMessage { text } => {
                task.result_text.push_str(&text);
            }
            StreamEvent::ToolUseBegin { tool, summary } => {
                task.tool_history.push(ToolHistoryEntry {
                    tool,
                    summary,
                    status: ToolStatus::Running,
                    timestamp: Utc::now(),
                });
            }
            StreamEvent::ToolUseEnd { tool, summary, success } => {
                if !task.close_tool_entry(&tool, summary, success) {
                    debug!("tool_use_end without matching begin for {} on {}", tool, task_id);
                }
            }
            StreamEvent::TokenUsage { usage } => {
                // Cumulative values from the worker: overwrite, never add.
                task.usage = usage;
            }
            StreamEvent::Result { text, session_id } => {
                task.result_text = text;
                if session_id.is_some() {
                    task.session_id = session_id;
                }
            }
            StreamEvent::Error { message } => {
                // State does not change here; the worker follows up with
                // task:error.
                task.error_message = Some(message);
            }
            StreamEvent::RateLimit { info } => {
                debug!("Rate limit notice on task {}: {}", task_id, info);
            }
        }

        self.emit_stream_update(task_id, now);
    }

    /// Debounce chat updates to one per second per task; updates inside the
    /// window collapse into a single trailing callback.
    fn emit_stream_update(&mut self, task_id: &str, now: Instant) {
        let window = Duration::from_millis(STREAM_THROTTLE_MS);
        let state = self.throttles.entry(task_id.to_string()).or_default();
        match state.last_emit {
            Some(last) if now.duration_since(last) < window => {
                if state.trailing.is_none() {
                    state.trailing = Some(last + window);
                }
            }
            _ => {
                state.last_emit = Some(now);
                state.trailing = None;
                if let Some(task) = self.tasks.get(task_id) {
                    emit(
                        &self.events,
                        CoordinatorEvent::TaskStreamUpdate { task: task.clone() },
                    );
                }
            }
        }
    }

    // ========================================================================
    // Terminal transitions
    // ========================================================================

    /// Worker reported terminal success.
    pub fn on_complete(
        &mut self,
        registry: &mut WorkerRegistry,
        task_id: &str,
        payload: TaskCompletePayload,
        now: Instant,
    ) -> Vec<TransferJob> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return Vec::new();
        };
        if task.status != TaskStatus::Running {
            debug!("Dropping task:complete for {} task {}", task.status, task_id);
            return Vec::new();
        }

        if !payload.result_text.is_empty() {
            task.result_text = payload.result_text;
        }
        if !payload.usage.is_zero() {
            task.usage = payload.usage;
        }
        if payload.session_id.is_some() {
            task.session_id = payload.session_id;
        }
        if let Some(session_id) = task.session_id.clone() {
            let record = SessionRecord {
                task_id: task_id.to_string(),
                prompt: task.prompt.clone(),
                worker_id: task.worker_id.clone(),
                cwd: task.cwd.clone(),
                session_id,
            };
            self.sessions.push(record);
        }

        self.terminal_transition(registry, task_id, TaskStatus::Completed, now)
    }

    /// Worker reported terminal failure; partial result and tokens allowed.
    pub fn on_error(
        &mut self,
        registry: &mut WorkerRegistry,
        task_id: &str,
        payload: TaskErrorPayload,
        now: Instant,
    ) -> Vec<TransferJob> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return Vec::new();
        };
        if task.status != TaskStatus::Running {
            debug!("Dropping task:error for {} task {}", task.status, task_id);
            return Vec::new();
        }

        warn!("Task {} failed ({}): {}", task_id, payload.code, payload.message);
        task.error_message = Some(payload.message);
        if let Some(partial) = payload.partial_result {
            if !partial.is_empty() {
                task.result_text = partial;
            }
        }
        if !payload.usage.is_zero() {
            task.usage = payload.usage;
        }

        self.terminal_transition(registry, task_id, TaskStatus::Failed, now)
    }

    /// Cancel a task. Queued tasks are dequeued; Running tasks get an
    /// advisory `task:cancel` and transition immediately, without waiting
    /// for the worker. Returns false (no-op) for unknown or terminal tasks.
    pub fn cancel_task(
        &mut self,
        registry: &mut WorkerRegistry,
        task_id: &str,
        reason: &str,
        now: Instant,
    ) -> (bool, Vec<TransferJob>) {
        let Some(task) = self.tasks.get_mut(task_id) else {
            return (false, Vec::new());
        };
        if task.status.is_terminal() {
            return (false, Vec::new());
        }

        info!("Cancelling task {} ({})", task_id, reason);
        match task.status {
            TaskStatus::Queued => {
                self.queue.remove(task_id);
            }
            TaskStatus::Running => {
                if let Some(worker_id) = task.worker_id.clone() {
                    let payload = TaskCancelPayload {
                        reason: reason.to_string(),
                    };
                    if let Ok(envelope) = Envelope::new(MessageType::TaskCancel, &payload) {
                        let envelope = envelope.with_task(task_id).with_worker(&worker_id);
                        registry.send_to_worker(&worker_id, &envelope);
                    }
                }
            }
            _ => unreachable!("terminal handled above"),
        }
        if task.error_message.is_none() {
            task.error_message = Some(reason.to_string());
        }

        let jobs = self.terminal_transition(registry, task_id, TaskStatus::Cancelled, now);
        (true, jobs)
    }

    /// The worker's transport closed (or its heartbeat watchdog expired)
    /// while a task was running: fail that task.
    pub fn on_worker_disconnected(
        &mut self,
        registry: &mut WorkerRegistry,
        worker_id: &str,
        running_task: Option<String>,
        now: Instant,
    ) -> Vec<TransferJob> {
        let Some(task_id) = running_task else {
            return self.dispatch_next(registry, now);
        };
        let Some(task) = self.tasks.get_mut(&task_id) else {
            return self.dispatch_next(registry, now);
        };
        if task.status != TaskStatus::Running || task.worker_id.as_deref() != Some(worker_id) {
            return self.dispatch_next(registry, now);
        }

        // WORKER_DISCONNECT: only this worker's running task fails.
        task.error_message = Some(format!("worker {} disconnected mid-task", worker_id));
        self.terminal_transition(registry, &task_id, TaskStatus::Failed, now)
    }

    /// One terminal transition per task: tear down timers and transfer
    /// correlations, release the worker, fire the matching callback, then
    /// advance the queue.
    fn terminal_transition(
        &mut self,
        registry: &mut WorkerRegistry,
        task_id: &str,
        status: TaskStatus,
        now: Instant,
    ) -> Vec<TransferJob> {
        self.timeouts.remove(task_id);
        self.throttles.remove(task_id);
        self.pending_transfers.retain(|(tid, _), _| tid != task_id);

        let Some(task) = self.tasks.get_mut(task_id) else {
            return Vec::new();
        };
        debug_assert!(status.is_terminal());
        task.status = status;
        task.completed_at = Some(Utc::now());
        if let Some(worker_id) = task.worker_id.clone() {
            registry.release(&worker_id);
        }

        let snapshot = task.clone();
        let event = match status {
            TaskStatus::Completed => CoordinatorEvent::TaskCompleted { task: snapshot },
            TaskStatus::Failed => CoordinatorEvent::TaskFailed { task: snapshot },
            TaskStatus::Cancelled => CoordinatorEvent::TaskCancelled { task: snapshot },
            _ => unreachable!("terminal_transition called with non-terminal status"),
        };
        emit(&self.events, event);

        self.dispatch_next(registry, now)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Drive time-based behaviour: trailing throttle callbacks and task
    /// timeouts (implemented as self-cancellations).
    pub fn tick(&mut self, registry: &mut WorkerRegistry, now: Instant) -> Vec<TransferJob> {
        let due_trailing: Vec<String> = self
            .throttles
            .iter()
            .filter(|(_, state)| state.trailing.is_some_and(|at| now >= at))
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in due_trailing {
            if let Some(state) = self.throttles.get_mut(&task_id) {
                state.trailing = None;
                state.last_emit = Some(now);
            }
            if let Some(task) = self.tasks.get(&task_id) {
                emit(
                    &self.events,
                    CoordinatorEvent::TaskStreamUpdate { task: task.clone() },
                );
            }
        }

        let timed_out: Vec<String> = self
            .timeouts
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(id, _)| id.clone())
            .collect();
        let mut jobs = Vec::new();
        for task_id in timed_out {
            warn!("Task {} timed out", task_id);
            let (_, mut dispatched) = self.cancel_task(registry, &task_id, "timeout", now);
            jobs.append(&mut dispatched);
        }
        jobs
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Most recent session id recorded for the `(worker, cwd)` tuple; used
    /// by the adapter to build continuation tasks.
    pub fn latest_session_for(
        &self,
        worker_id: Option<&str>,
        cwd: Option<&str>,
    ) -> Option<&SessionRecord> {
        self.sessions
            .iter()
            .rev()
            .find(|record| record.worker_id.as_deref() == worker_id && record.cwd.as_deref() == cwd)
    }
}
