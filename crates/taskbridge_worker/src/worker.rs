//! Worker node: maintains the coordinator connection, answers heartbeats,
//! stages attachments, and supervises one CLI execution at a time.
//!
//! The connection is re-established on any close with exponential backoff;
//! every (re)connection runs the register handshake from scratch, and work
//! in flight at disconnect time is lost by design (the coordinator already
//! failed it).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use taskbridge_protocol::defaults::{
    ATTACHMENT_MAX_BYTES, AUTH_TIMEOUT_MS, HEARTBEAT_INTERVAL_MS, RECONNECT_BASE_MS,
    RECONNECT_JITTER, RECONNECT_MAX_MS,
};
use taskbridge_protocol::error::codes;
use taskbridge_protocol::types::{
    FileTransferAck, HeartbeatPayload, RegisterAck, RegisterPayload, TaskAssignPayload,
    TaskCompletePayload, TaskErrorPayload, TaskQuestionPayload, TokenUsage, WorkerStatus,
};
use taskbridge_protocol::{Envelope, MessageType, PROTOCOL_VERSION};

use crate::attachments;
use crate::executor::{self, ExecutionRequest, ExecutorEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Worker configuration (plain data).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub coordinator_url: String,
    pub shared_secret: String,
    pub name: String,
    /// Assistant CLI program to spawn.
    pub cli_command: String,
    pub default_cwd: PathBuf,
    /// Directories accepted as a task cwd; empty means any.
    pub allowed_dirs: Vec<PathBuf>,
}

/// Exponential reconnect backoff: 1 s base doubling to a 60 s cap, with
/// +/-20% jitter on every delay.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(16);
        self.attempt = self.attempt.saturating_add(1);
        let base = (RECONNECT_BASE_MS.saturating_mul(1u64 << exp)).min(RECONNECT_MAX_MS);
        let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * RECONNECT_JITTER;
        Duration::from_millis((base as f64 * jitter) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Connect-register-serve forever; each connection loss backs off and
/// retries from the handshake.
pub async fn run(config: WorkerConfig) -> Result<()> {
    let mut backoff = ReconnectBackoff::new();
    loop {
        match run_connection(&config, &mut backoff).await {
            Ok(()) => info!("Connection closed by coordinator"),
            Err(e) => warn!("Connection ended: {}", e),
        }
        let delay = backoff.next_delay();
        info!("Reconnecting in {} ms", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}

/// One connection lifetime: handshake, then the serve loop until close.
pub async fn run_connection(config: &WorkerConfig, backoff: &mut ReconnectBackoff) -> Result<()> {
    let (ws, _) = connect_async(config.coordinator_url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", config.coordinator_url))?;
    info!("Connected to coordinator: {}", config.coordinator_url);
    let (mut sink, mut source) = ws.split();

    register(config, &mut sink, &mut source).await?;
    backoff.reset();

    let mut session = Session::new(config.clone(), sink);
    session.serve(&mut source).await
}

/// Send `worker:register` and wait for a successful ack inside the auth
/// window.
async fn register(config: &WorkerConfig, sink: &mut WsSink, source: &mut WsSource) -> Result<()> {
    let payload = RegisterPayload {
        name: config.name.clone(),
        secret: config.shared_secret.clone(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        os: std::env::consts::OS.to_string(),
        runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        default_cwd: config.default_cwd.display().to_string(),
        allowed_dirs: config
            .allowed_dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect(),
    };
    let envelope = Envelope::new(MessageType::WorkerRegister, &payload)?
        .with_worker(&config.name);
    sink.send(Message::text(envelope.encode()?)).await?;
    info!("Sent worker:register as '{}'", config.name);

    let deadline = Duration::from_millis(AUTH_TIMEOUT_MS);
    loop {
        let frame = timeout(deadline, source.next())
            .await
            .map_err(|_| anyhow!("register ack not received within {} ms", AUTH_TIMEOUT_MS))?
            .ok_or_else(|| anyhow!("connection closed during handshake"))?
            .context("transport error during handshake")?;
        let Message::Text(text) = frame else {
            continue;
        };
        let envelope = Envelope::decode(text.as_str()).context("malformed handshake envelope")?;
        if envelope.message_type != MessageType::WorkerRegisterAck {
            debug!("Ignoring {} before register ack", envelope.message_type);
            continue;
        }
        let ack: RegisterAck = envelope.payload_as()?;
        if !ack.success {
            bail!(
                "registration rejected: {}",
                ack.message.unwrap_or_else(|| "no reason given".to_string())
            );
        }
        if ack.protocol_version != PROTOCOL_VERSION {
            warn!(
                "Coordinator protocol version {} differs from worker {} (continuing)",
                ack.protocol_version, PROTOCOL_VERSION
            );
        }
        info!("Registered with coordinator");
        return Ok(());
    }
}

struct ActiveTask {
    task_id: String,
    kill_tx: Option<oneshot::Sender<String>>,
}

struct Session {
    config: WorkerConfig,
    sink: WsSink,
    active: Option<ActiveTask>,
    exec_tx: mpsc::UnboundedSender<(String, ExecutorEvent)>,
    exec_rx: mpsc::UnboundedReceiver<(String, ExecutorEvent)>,
}

impl Session {
    fn new(config: WorkerConfig, sink: WsSink) -> Self {
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        Self {
            config,
            sink,
            active: None,
            exec_tx,
            exec_rx,
        }
    }

    async fn serve(&mut self, source: &mut WsSource) -> Result<()> {
        let mut heartbeat = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; that doubles as the post-register
        // status report.
        loop {
            tokio::select! {
                frame = source.next() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    match frame.context("transport error")? {
                        Message::Text(text) => match Envelope::decode(text.as_str()) {
                            Ok(envelope) => self.handle_envelope(envelope).await?,
                            Err(e) => warn!("Dropping malformed envelope: {}", e),
                        },
                        Message::Close(_) => return Ok(()),
                        Message::Ping(_) | Message::Pong(_) => {}
                        other => debug!("Ignoring unsupported frame: {:?}", other),
                    }
                }
                _ = heartbeat.tick() => {
                    self.send_heartbeat().await?;
                }
                event = self.exec_rx.recv() => {
                    if let Some((task_id, event)) = event {
                        self.handle_executor_event(task_id, event).await?;
                    }
                }
            }
        }
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.message_type {
            MessageType::TaskAssign => {
                let Some(task_id) = envelope.task_id.clone() else {
                    warn!("task:assign without taskId");
                    return Ok(());
                };
                match envelope.payload_as::<TaskAssignPayload>() {
                    Ok(payload) => self.handle_assign(task_id, payload).await?,
                    Err(e) => warn!("Bad task:assign payload: {}", e),
                }
            }
            MessageType::TaskCancel => {
                let Some(task_id) = envelope.task_id.clone() else {
                    return Ok(());
                };
                self.handle_cancel(&task_id, envelope);
            }
            MessageType::FileTransfer => {
                let Some(task_id) = envelope.task_id.clone() else {
                    warn!("file:transfer without taskId");
                    return Ok(());
                };
                self.handle_file_transfer(&task_id, envelope).await?;
            }
            MessageType::TaskAnswer => {
                // Stdin is closed by contract; answers come back as
                // continuation tasks, so this is informational only.
                info!("Received task:answer for {:?}; answered via continuation", envelope.task_id);
            }
            MessageType::TaskPermissionResponse => {
                info!(
                    "Received task:permission_response for {:?}; resolved via continuation",
                    envelope.task_id
                );
            }
            MessageType::WorkerRegisterAck | MessageType::WorkerHeartbeatAck => {}
            other => debug!("Ignoring {} from coordinator", other),
        }
        Ok(())
    }

    async fn handle_assign(&mut self, task_id: String, payload: TaskAssignPayload) -> Result<()> {
        if let Some(active) = &self.active {
            warn!(
                "Refusing task {}: already running {}",
                task_id, active.task_id
            );
            return self
                .send_task_error(
                    &task_id,
                    codes::SPAWN_ERROR,
                    "worker is already running a task",
                )
                .await;
        }

        let cwd = payload
            .cwd
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.default_cwd.clone());
        if !self.cwd_allowed(&cwd) {
            warn!("Refusing task {}: cwd {} outside allowlist", task_id, cwd.display());
            return self
                .send_task_error(
                    &task_id,
                    codes::DIRECTORY_NOT_ALLOWED,
                    &format!("directory not allowed: {}", cwd.display()),
                )
                .await;
        }

        info!("Starting task {} in {}", task_id, cwd.display());
        let request = ExecutionRequest {
            task_id: task_id.clone(),
            prompt: payload.prompt,
            cwd,
            permission_mode: payload.permission_mode,
            session_id: payload.session_id,
            attachments: payload.attachments,
        };
        let (kill_tx, kill_rx) = oneshot::channel();
        let events = self.exec_tx.clone();
        let cli = self.config.cli_command.clone();
        let id_for_events = task_id.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let run = executor::execute(&cli, request, tx, kill_rx);
            tokio::pin!(run);
            loop {
                tokio::select! {
                    _ = &mut run => break,
                    Some(event) = rx.recv() => {
                        if events.send((id_for_events.clone(), event)).is_err() {
                            return;
                        }
                    }
                }
            }
            while let Ok(event) = rx.try_recv() {
                if events.send((id_for_events.clone(), event)).is_err() {
                    return;
                }
            }
        });

        self.active = Some(ActiveTask {
            task_id,
            kill_tx: Some(kill_tx),
        });
        Ok(())
    }

    fn handle_cancel(&mut self, task_id: &str, envelope: Envelope) {
        let reason = envelope
            .payload_as::<taskbridge_protocol::types::TaskCancelPayload>()
            .map(|p| p.reason)
            .unwrap_or_else(|_| "cancelled".to_string());
        match &mut self.active {
            Some(active) if active.task_id == task_id => {
                info!("Cancel requested for task {}: {}", task_id, reason);
                if let Some(kill) = active.kill_tx.take() {
                    let _ = kill.send(reason);
                }
            }
            _ => debug!("Cancel for inactive task {}", task_id),
        }
    }

    async fn handle_file_transfer(&mut self, task_id: &str, envelope: Envelope) -> Result<()> {
        let payload = match envelope.payload_as::<taskbridge_protocol::types::FileTransferPayload>() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Bad file:transfer payload: {}", e);
                return Ok(());
            }
        };

        let ack = match BASE64.decode(payload.data.as_bytes()) {
            Ok(bytes) if bytes.len() as u64 > ATTACHMENT_MAX_BYTES => FileTransferAck {
                file_name: payload.file_name.clone(),
                success: false,
                local_path: None,
                message: Some("attachment exceeds the 8 MiB limit".to_string()),
            },
            Ok(bytes) => match attachments::stage_file(task_id, &payload.file_name, &bytes) {
                Ok(path) => FileTransferAck {
                    file_name: payload.file_name.clone(),
                    success: true,
                    local_path: Some(path.display().to_string()),
                    message: None,
                },
                Err(e) => FileTransferAck {
                    file_name: payload.file_name.clone(),
                    success: false,
                    local_path: None,
                    message: Some(e.to_string()),
                },
            },
            Err(e) => FileTransferAck {
                file_name: payload.file_name.clone(),
                success: false,
                local_path: None,
                message: Some(format!("invalid base64 payload: {}", e)),
            },
        };

        let envelope = Envelope::new(MessageType::FileTransferAck, &ack)?
            .with_task(task_id)
            .with_worker(&self.config.name);
        self.send(envelope).await
    }

    async fn handle_executor_event(&mut self, task_id: String, event: ExecutorEvent) -> Result<()> {
        match event {
            ExecutorEvent::Stream(stream_event) => {
                let envelope = Envelope::new(MessageType::TaskStream, &stream_event)?
                    .with_task(&task_id)
                    .with_worker(&self.config.name);
                self.send(envelope).await?;
            }
            ExecutorEvent::Question(question) => {
                let payload = TaskQuestionPayload { question };
                let envelope = Envelope::new(MessageType::TaskQuestion, &payload)?
                    .with_task(&task_id)
                    .with_worker(&self.config.name);
                self.send(envelope).await?;
            }
            ExecutorEvent::Completed {
                result_text,
                session_id,
                usage,
            } => {
                info!("Task {} completed", task_id);
                let payload = TaskCompletePayload {
                    result_text,
                    session_id,
                    usage,
                };
                let envelope = Envelope::new(MessageType::TaskComplete, &payload)?
                    .with_task(&task_id)
                    .with_worker(&self.config.name);
                self.finish_task(&task_id);
                self.send(envelope).await?;
            }
            ExecutorEvent::Failed {
                code,
                message,
                partial_result,
                usage,
            } => {
                warn!("Task {} failed ({}): {}", task_id, code, message);
                let payload = TaskErrorPayload {
                    code,
                    message,
                    partial_result,
                    usage,
                };
                let envelope = Envelope::new(MessageType::TaskError, &payload)?
                    .with_task(&task_id)
                    .with_worker(&self.config.name);
                self.finish_task(&task_id);
                self.send(envelope).await?;
            }
        }
        Ok(())
    }

    /// Terminal bookkeeping for one task, success or not.
    fn finish_task(&mut self, task_id: &str) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.task_id == task_id)
        {
            self.active = None;
        }
        attachments::cleanup(task_id);
    }

    fn cwd_allowed(&self, cwd: &Path) -> bool {
        if self.config.allowed_dirs.is_empty() {
            return true;
        }
        self.config
            .allowed_dirs
            .iter()
            .any(|allowed| cwd.starts_with(allowed))
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        let payload = HeartbeatPayload {
            status: if self.active.is_some() {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Online
            },
            current_task_id: self.active.as_ref().map(|a| a.task_id.clone()),
        };
        let envelope = Envelope::new(MessageType::WorkerHeartbeat, &payload)?
            .with_worker(&self.config.name);
        self.send(envelope).await
    }

    async fn send_task_error(&mut self, task_id: &str, code: &str, message: &str) -> Result<()> {
        let payload = TaskErrorPayload {
            code: code.to_string(),
            message: message.to_string(),
            partial_result: None,
            usage: TokenUsage::default(),
        };
        let envelope = Envelope::new(MessageType::TaskError, &payload)?
            .with_task(task_id)
            .with_worker(&self.config.name);
        self.send(envelope).await
    }

    async fn send(&mut self, envelope: Envelope) -> Result<()> {
        self.sink
            .send(Message::text(envelope.encode()?))
            .await
            .context("failed to write frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_to_cap_with_jitter() {
        let mut backoff = ReconnectBackoff::new();
        let expected_bases = [1_000u64, 2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000];
        for base in expected_bases {
            let delay = backoff.next_delay().as_millis() as u64;
            let low = (base as f64 * (1.0 - RECONNECT_JITTER)) as u64;
            let high = (base as f64 * (1.0 + RECONNECT_JITTER)) as u64 + 1;
            assert!(
                (low..=high).contains(&delay),
                "delay {} outside [{}, {}] for base {}",
                delay,
                low,
                high,
                base
            );
        }
    }

    #[test]
    fn test_backoff_reset_restarts_sequence() {
        let mut backoff = ReconnectBackoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay().as_millis() as u64;
        assert!(delay <= 1_200, "delay after reset was {}", delay);
    }
}
