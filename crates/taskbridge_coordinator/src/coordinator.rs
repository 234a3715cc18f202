//! Coordinator loop: the single logical thread of control that owns the
//! worker registry and the task manager.
//!
//! Connection tasks, the chat adapter, and spawned transfer tasks all talk
//! to the loop through [`Command`]s; the loop is the only place mutable
//! state changes, so message handling for one worker happens in receive
//! order and every lifecycle transition runs exactly once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use taskbridge_protocol::defaults::TRANSFER_BUDGET_MS;
use taskbridge_protocol::types::{
    AnswerPayload, AttachmentMeta, FileTransferPayload, PermissionResponsePayload,
};
use taskbridge_protocol::{Envelope, MessageType};

use crate::events::{emit, CoordinatorEvent, EventReceiver, EventSender};
use crate::manager::{AdmissionError, TaskManager, TransferJob};
use crate::registry::{RegisterOutcome, WorkerHandle, WorkerRegistry};
use crate::task::{SessionRecord, Task, TaskOptions};

/// How often the loop checks heartbeat watchdogs, task timeouts, and
/// trailing throttle callbacks.
const SWEEP_INTERVAL_MS: u64 = 250;

/// Messages driving the coordinator loop.
#[derive(Debug)]
pub enum Command {
    ConnectionOpened {
        conn_id: u64,
        handle: WorkerHandle,
    },
    Inbound {
        conn_id: u64,
        envelope: Envelope,
    },
    ConnectionClosed {
        conn_id: u64,
    },
    CreateTask {
        options: TaskOptions,
        reply: oneshot::Sender<Result<Task, AdmissionError>>,
    },
    CancelTask {
        task_id: String,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    AnswerTask {
        task_id: String,
        answer: String,
    },
    RespondPermission {
        task_id: String,
        approved: bool,
    },
    GetTask {
        task_id: String,
        reply: oneshot::Sender<Option<Task>>,
    },
    Workers {
        reply: oneshot::Sender<Vec<crate::registry::WorkerInfo>>,
    },
    LatestSession {
        worker_id: Option<String>,
        cwd: Option<String>,
        reply: oneshot::Sender<Option<SessionRecord>>,
    },
    TransferResolved {
        task_id: String,
        attachments: Vec<AttachmentMeta>,
    },
    Shutdown,
}

/// Clonable command API for the chat adapter (and the transport layer).
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    pub fn command_sender(&self) -> mpsc::UnboundedSender<Command> {
        self.tx.clone()
    }

    pub async fn create_task(&self, options: TaskOptions) -> Result<Task> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CreateTask { options, reply })
            .map_err(|_| anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow!("coordinator stopped"))?
            .map_err(Into::into)
    }

    pub async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::CancelTask {
                task_id: task_id.to_string(),
                reason: reason.to_string(),
                reply,
            })
            .map_err(|_| anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow!("coordinator stopped"))
    }

    pub fn answer_task(&self, task_id: &str, answer: &str) {
        let _ = self.tx.send(Command::AnswerTask {
            task_id: task_id.to_string(),
            answer: answer.to_string(),
        });
    }

    pub fn respond_permission(&self, task_id: &str, approved: bool) {
        let _ = self.tx.send(Command::RespondPermission {
            task_id: task_id.to_string(),
            approved,
        });
    }

    pub async fn task(&self, task_id: &str) -> Result<Option<Task>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetTask {
                task_id: task_id.to_string(),
                reply,
            })
            .map_err(|_| anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow!("coordinator stopped"))
    }

    pub async fn workers(&self) -> Result<Vec<crate::registry::WorkerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Workers { reply })
            .map_err(|_| anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow!("coordinator stopped"))
    }

    pub async fn latest_session(
        &self,
        worker_id: Option<String>,
        cwd: Option<String>,
    ) -> Result<Option<SessionRecord>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::LatestSession {
                worker_id,
                cwd,
                reply,
            })
            .map_err(|_| anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow!("coordinator stopped"))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

pub struct Coordinator {
    registry: WorkerRegistry,
    manager: TaskManager,
    events: EventSender,
    commands: mpsc::UnboundedReceiver<Command>,
    command_tx: mpsc::UnboundedSender<Command>,
    /// Open but not yet registered connections.
    pending: HashMap<u64, WorkerHandle>,
    /// Registered connections: conn id -> worker name.
    authed: HashMap<u64, String>,
    running: bool,
}

impl Coordinator {
    pub fn new(shared_secret: String) -> (Self, CoordinatorHandle, EventReceiver) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            registry: WorkerRegistry::new(shared_secret),
            manager: TaskManager::new(event_tx.clone()),
            events: event_tx,
            commands: command_rx,
            command_tx: command_tx.clone(),
            pending: HashMap::new(),
            authed: HashMap::new(),
            running: false,
        };
        (coordinator, CoordinatorHandle { tx: command_tx }, event_rx)
    }

    /// Main event loop.
    pub async fn run(&mut self) -> Result<()> {
        self.running = true;
        info!("Coordinator event loop started");
        let mut sweep = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));

        while self.running {
            tokio::select! {
                maybe_command = self.commands.recv() => {
                    match maybe_command {
                        Some(command) => self.handle_command(command),
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.on_sweep(Instant::now());
                }
            }
        }

        info!("Coordinator stopped");
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::ConnectionOpened { conn_id, handle } => {
                self.pending.insert(conn_id, handle);
            }
            Command::Inbound { conn_id, envelope } => {
                self.handle_envelope(conn_id, envelope, now);
            }
            Command::ConnectionClosed { conn_id } => {
                self.handle_connection_closed(conn_id, now);
            }
            Command::CreateTask { options, reply } => {
                let created = self.manager.create_task(options);
                if created.is_ok() {
                    let jobs = self.manager.dispatch_next(&mut self.registry, now);
                    self.spawn_transfers(jobs);
                }
                let _ = reply.send(created);
            }
            Command::CancelTask { task_id, reason, reply } => {
                let (cancelled, jobs) =
                    self.manager
                        .cancel_task(&mut self.registry, &task_id, &reason, now);
                self.spawn_transfers(jobs);
                let _ = reply.send(cancelled);
            }
            Command::AnswerTask { task_id, answer } => {
                self.send_to_task_worker(
                    &task_id,
                    MessageType::TaskAnswer,
                    &AnswerPayload { answer },
                );
            }
            Command::RespondPermission { task_id, approved } => {
                self.send_to_task_worker(
                    &task_id,
                    MessageType::TaskPermissionResponse,
                    &PermissionResponsePayload { approved },
                );
            }
            Command::GetTask { task_id, reply } => {
                let _ = reply.send(self.manager.task(&task_id).cloned());
            }
            Command::Workers { reply } => {
                let _ = reply.send(self.registry.snapshots());
            }
            Command::LatestSession { worker_id, cwd, reply } => {
                let record = self
                    .manager
                    .latest_session_for(worker_id.as_deref(), cwd.as_deref())
                    .cloned();
                let _ = reply.send(record);
            }
            Command::TransferResolved { task_id, attachments } => {
                self.manager
                    .finish_dispatch(&mut self.registry, &task_id, attachments);
            }
            Command::Shutdown => {
                self.running = false;
            }
        }
    }

    fn handle_envelope(&mut self, conn_id: u64, envelope: Envelope, now: Instant) {
        // Registration is the only thing an unauthenticated connection may say.
        if !self.authed.contains_key(&conn_id) {
            if envelope.message_type != MessageType::WorkerRegister {
                warn!(
                    "Connection {} sent {} before registering; closing",
                    conn_id, envelope.message_type
                );
                if let Some(handle) = self.pending.remove(&conn_id) {
                    handle.close();
                }
                return;
            }
            self.handle_register(conn_id, envelope, now);
            return;
        }

        match envelope.message_type {
            MessageType::WorkerRegister => {
                debug!("Connection {} re-sent worker:register; ignoring", conn_id);
            }
            MessageType::WorkerHeartbeat => match envelope.payload_as() {
                Ok(payload) => self.registry.heartbeat(conn_id, payload, now),
                Err(e) => warn!("Bad heartbeat payload from conn {}: {}", conn_id, e),
            },
            MessageType::TaskStream => {
                let Some(task_id) = envelope.task_id.clone() else {
                    warn!("task:stream without taskId from conn {}", conn_id);
                    return;
                };
                match envelope.payload_as() {
                    Ok(event) => self.manager.on_stream(&task_id, event, now),
                    Err(e) => warn!("Bad stream payload for {}: {}", task_id, e),
                }
            }
            MessageType::TaskComplete => {
                let Some(task_id) = envelope.task_id.clone() else {
                    warn!("task:complete without taskId from conn {}", conn_id);
                    return;
                };
                match envelope.payload_as() {
                    Ok(payload) => {
                        let jobs =
                            self.manager
                                .on_complete(&mut self.registry, &task_id, payload, now);
                        self.spawn_transfers(jobs);
                    }
                    Err(e) => warn!("Bad task:complete payload for {}: {}", task_id, e),
                }
            }
            MessageType::TaskError => {
                let Some(task_id) = envelope.task_id.clone() else {
                    warn!("task:error without taskId from conn {}", conn_id);
                    return;
                };
                match envelope.payload_as() {
                    Ok(payload) => {
                        let jobs =
                            self.manager
                                .on_error(&mut self.registry, &task_id, payload, now);
                        self.spawn_transfers(jobs);
                    }
                    Err(e) => warn!("Bad task:error payload for {}: {}", task_id, e),
                }
            }
            MessageType::FileTransferAck => {
                let Some(task_id) = envelope.task_id.clone() else {
                    warn!("file:transfer_ack without taskId from conn {}", conn_id);
                    return;
                };
                match envelope.payload_as() {
                    Ok(ack) => self.manager.handle_transfer_ack(&task_id, ack),
                    Err(e) => warn!("Bad file:transfer_ack payload for {}: {}", task_id, e),
                }
            }
            MessageType::TaskQuestion => {
                let Some(task_id) = envelope.task_id.clone() else {
                    return;
                };
                match envelope.payload_as() {
                    Ok(payload) => emit(
                        &self.events,
                        CoordinatorEvent::TaskQuestion { task_id, payload },
                    ),
                    Err(e) => warn!("Bad task:question payload for {}: {}", task_id, e),
                }
            }
            MessageType::TaskPermission => {
                let Some(task_id) = envelope.task_id.clone() else {
                    return;
                };
                match envelope.payload_as() {
                    Ok(payload) => emit(
                        &self.events,
                        CoordinatorEvent::TaskPermission { task_id, payload },
                    ),
                    Err(e) => warn!("Bad task:permission payload for {}: {}", task_id, e),
                }
            }
            MessageType::TeamUpdate => {
                let worker_id = self
                    .authed
                    .get(&conn_id)
                    .cloned()
                    .unwrap_or_default();
                emit(
                    &self.events,
                    CoordinatorEvent::TeamUpdate {
                        worker_id,
                        payload: envelope.payload,
                    },
                );
            }
            other => {
                warn!("Unhandled message {} from conn {}", other, conn_id);
            }
        }
    }

    fn handle_register(&mut self, conn_id: u64, envelope: Envelope, now: Instant) {
        let Some(handle) = self.pending.remove(&conn_id) else {
            warn!("Register from unknown connection {}", conn_id);
            return;
        };
        let payload = match envelope.payload_as() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad register payload from conn {}: {}", conn_id, e);
                handle.close();
                return;
            }
        };

        match self.registry.register(conn_id, handle, payload, now) {
            RegisterOutcome::Accepted {
                worker,
                replaced_running_task,
            } => {
                let name = worker.name.clone();
                self.authed.retain(|_, n| n != &name);
                self.authed.insert(conn_id, name.clone());
                emit(&self.events, CoordinatorEvent::WorkerConnected { worker });

                // A replaced connection's in-flight task is lost.
                if replaced_running_task.is_some() {
                    let jobs = self.manager.on_worker_disconnected(
                        &mut self.registry,
                        &name,
                        replaced_running_task,
                        now,
                    );
                    self.spawn_transfers(jobs);
                }

                // A fresh worker may unblock the queue head.
                let jobs = self.manager.dispatch_next(&mut self.registry, now);
                self.spawn_transfers(jobs);
            }
            RegisterOutcome::Rejected => {
                // Ack and close already went out; nothing recorded.
            }
        }
    }

    fn handle_connection_closed(&mut self, conn_id: u64, now: Instant) {
        self.pending.remove(&conn_id);
        let Some(name) = self.authed.remove(&conn_id) else {
            return;
        };
        // A superseded connection no longer owns the record.
        let Some((worker_id, running_task)) = self.registry.remove_by_conn(conn_id) else {
            debug!("Connection {} for '{}' was already replaced", conn_id, name);
            return;
        };

        info!("Worker '{}' disconnected", worker_id);
        emit(
            &self.events,
            CoordinatorEvent::WorkerDisconnected {
                worker_id: worker_id.clone(),
                had_running_task: running_task.is_some(),
            },
        );
        let jobs = self
            .manager
            .on_worker_disconnected(&mut self.registry, &worker_id, running_task, now);
        self.spawn_transfers(jobs);
    }

    /// Periodic timer work: heartbeat watchdogs expire exactly like socket
    /// closes; the manager drives task timeouts and trailing throttles.
    fn on_sweep(&mut self, now: Instant) {
        for (worker_id, running_task) in self.registry.remove_stale(now) {
            self.authed.retain(|_, name| name != &worker_id);
            emit(
                &self.events,
                CoordinatorEvent::WorkerDisconnected {
                    worker_id: worker_id.clone(),
                    had_running_task: running_task.is_some(),
                },
            );
            let jobs = self
                .manager
                .on_worker_disconnected(&mut self.registry, &worker_id, running_task, now);
            self.spawn_transfers(jobs);
        }

        let jobs = self.manager.tick(&mut self.registry, now);
        self.spawn_transfers(jobs);
    }

    fn send_to_task_worker<T: serde::Serialize>(
        &mut self,
        task_id: &str,
        message_type: MessageType,
        payload: &T,
    ) {
        let Some(worker_id) = self
            .manager
            .task(task_id)
            .and_then(|t| t.worker_id.clone())
        else {
            warn!("No assigned worker for task {}; dropping {}", task_id, message_type);
            return;
        };
        match Envelope::new(message_type, payload) {
            Ok(envelope) => {
                let envelope = envelope.with_task(task_id).with_worker(&worker_id);
                if !self.registry.send_to_worker(&worker_id, &envelope) {
                    warn!("{} for task {} not delivered", message_type, task_id);
                }
            }
            Err(e) => warn!("Failed to encode {}: {}", message_type, e),
        }
    }

    /// Drive each attachment-delivery step off the loop; the result comes
    /// back as a `TransferResolved` command.
    fn spawn_transfers(&self, jobs: Vec<TransferJob>) {
        for job in jobs {
            let command_tx = self.command_tx.clone();
            tokio::spawn(async move {
                let (task_id, attachments) = run_transfer_job(job).await;
                let _ = command_tx.send(Command::TransferResolved { task_id, attachments });
            });
        }
    }
}

/// Download and push every unstaged attachment for one task, then await the
/// correlated acks, all under the per-task transfer budget. Failure is
/// non-fatal: the task runs with the attachment left by reference.
async fn run_transfer_job(mut job: TransferJob) -> (String, Vec<AttachmentMeta>) {
    let task_id = job.task_id.clone();
    let budget = Duration::from_millis(TRANSFER_BUDGET_MS);
    if timeout(budget, deliver_attachments(&mut job)).await.is_err() {
        warn!(
            "Attachment transfer budget exhausted for task {}; continuing without local files",
            task_id
        );
    }
    (task_id, job.attachments)
}

async fn deliver_attachments(job: &mut TransferJob) {
    let Some(handle) = job.handle.clone() else {
        warn!(
            "Worker {} has no open transport; skipping attachment transfer",
            job.worker_id
        );
        return;
    };

    for (file_name, ack_rx) in std::mem::take(&mut job.acks) {
        let Some(index) = job
            .attachments
            .iter()
            .position(|a| a.file_name == file_name)
        else {
            continue;
        };

        let url = job.attachments[index].url.clone();
        let bytes = match fetch_attachment(&url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Attachment download failed for {}: {}", file_name, e);
                continue;
            }
        };

        let payload = FileTransferPayload {
            file_name: file_name.clone(),
            data: BASE64.encode(&bytes),
            mime_type: Some(job.attachments[index].mime_type.clone()),
        };
        let envelope = match Envelope::new(MessageType::FileTransfer, &payload) {
            Ok(envelope) => envelope.with_task(&job.task_id).with_worker(&job.worker_id),
            Err(e) => {
                warn!("Failed to encode file:transfer for {}: {}", file_name, e);
                continue;
            }
        };
        if !handle.send_envelope(&envelope) {
            warn!("file:transfer for {} not delivered", file_name);
            continue;
        }

        match ack_rx.await {
            Ok(ack) if ack.success => {
                job.attachments[index].local_path = ack.local_path;
            }
            Ok(ack) => {
                warn!(
                    "Worker rejected attachment {}: {}",
                    file_name,
                    ack.message.unwrap_or_else(|| "unknown error".to_string())
                );
            }
            Err(_) => {
                warn!("Transfer ack for {} was dropped", file_name);
            }
        }
    }
}

async fn fetch_attachment(url: &str) -> Result<Vec<u8>> {
    let response = reqwest::get(url).await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}
