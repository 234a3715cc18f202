//! Worker registry: connected workers, registration auth, heartbeat
//! supervision, outbound routing, and dispatch selection.
//!
//! The registry owns every worker record and its transport handle; the task
//! manager asks for workers through the methods here and never touches the
//! map directly.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use taskbridge_protocol::defaults::HEARTBEAT_TIMEOUT_MS;
use taskbridge_protocol::types::{HeartbeatAck, HeartbeatPayload, RegisterAck, RegisterPayload, WorkerStatus};
use taskbridge_protocol::{Envelope, MessageType, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Frame handed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Message(String),
    Close,
}

/// Write half of one worker connection. Sends never block; a send to a
/// closed connection reports failure without buffering.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl WorkerHandle {
    pub fn new(tx: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self { tx }
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(frame) => self.tx.send(OutboundFrame::Message(frame)).is_ok(),
            Err(e) => {
                warn!("Failed to encode outbound envelope: {}", e);
                false
            }
        }
    }

    pub fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }
}

/// Connected worker state (kept in memory, not persisted).
///
/// The worker's self-declared name is the key in the registry map, not a
/// field here.
#[derive(Debug)]
pub struct ConnectedWorker {
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub os: String,
    pub runtime_version: String,
    pub default_cwd: String,
    pub allowed_dirs: Vec<String>,
    pub last_heartbeat: Instant,
    pub connected_at: DateTime<Utc>,
    conn_id: u64,
    handle: WorkerHandle,
}

/// Snapshot of a worker for events and status queries.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub name: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<String>,
    pub os: String,
    pub runtime_version: String,
    pub default_cwd: String,
    pub allowed_dirs: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

/// Result of processing a `worker:register`.
#[derive(Debug)]
pub enum RegisterOutcome {
    /// Worker recorded; carries the snapshot for the connected event and the
    /// task id the replaced connection was running, if any.
    Accepted {
        worker: WorkerInfo,
        replaced_running_task: Option<String>,
    },
    /// Bad secret; the ack was sent and the transport told to close.
    Rejected,
}

pub struct WorkerRegistry {
    workers: BTreeMap<String, ConnectedWorker>,
    shared_secret: String,
    round_robin: usize,
}

impl WorkerRegistry {
    pub fn new(shared_secret: String) -> Self {
        Self {
            workers: BTreeMap::new(),
            shared_secret,
            round_robin: 0,
        }
    }

    /// Authenticate and record a worker. On secret mismatch the ack goes out
    /// with `success:false` and the transport is closed; nothing is stored.
    pub fn register(
        &mut self,
        conn_id: u64,
        handle: WorkerHandle,
        payload: RegisterPayload,
        now: Instant,
    ) -> RegisterOutcome {
        if !secrets_match(&payload.secret, &self.shared_secret) {
            warn!(
                "Worker '{}' rejected ({}): bad shared secret",
                payload.name,
                taskbridge_protocol::error::codes::AUTH_FAILURE
            );
            let ack = RegisterAck {
                success: false,
                message: Some("authentication failed".to_string()),
                protocol_version: PROTOCOL_VERSION.to_string(),
            };
            if let Ok(envelope) = Envelope::new(MessageType::WorkerRegisterAck, &ack) {
                handle.send_envelope(&envelope);
            }
            handle.close();
            return RegisterOutcome::Rejected;
        }

        if payload.protocol_version != PROTOCOL_VERSION {
            warn!(
                "Worker '{}' protocol version {} differs from coordinator {} (continuing)",
                payload.name, payload.protocol_version, PROTOCOL_VERSION
            );
        }

        // A re-register by the same name replaces the old record; the stale
        // connection is closed and its in-flight task reported lost.
        let mut replaced_running_task = None;
        if let Some(previous) = self.workers.remove(&payload.name) {
            info!("Worker '{}' re-registered; replacing old connection", payload.name);
            replaced_running_task = previous.current_task_id.clone();
            previous.handle.close();
        }

        let worker = ConnectedWorker {
            status: WorkerStatus::Online,
            current_task_id: None,
            os: payload.os,
            runtime_version: payload.runtime_version,
            default_cwd: payload.default_cwd,
            allowed_dirs: payload.allowed_dirs,
            last_heartbeat: now,
            connected_at: Utc::now(),
            conn_id,
            handle,
        };

        let ack = RegisterAck {
            success: true,
            message: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        if let Ok(envelope) =
            Envelope::new(MessageType::WorkerRegisterAck, &ack).map(|e| e.with_worker(&payload.name))
        {
            worker.handle.send_envelope(&envelope);
        }

        info!("Worker registered: {}", payload.name);
        self.workers.insert(payload.name.clone(), worker);
        let info = self.snapshot(&payload.name).expect("just inserted");
        RegisterOutcome::Accepted {
            worker: info,
            replaced_running_task,
        }
    }

    /// Refresh liveness from a heartbeat and ack it. Unknown connections are
    /// ignored (the worker may already have been swept).
    pub fn heartbeat(&mut self, conn_id: u64, payload: HeartbeatPayload, now: Instant) {
        let Some((name, worker)) = self
            .workers
            .iter_mut()
            .find(|(_, w)| w.conn_id == conn_id)
        else {
            debug!("Heartbeat from unknown connection {}", conn_id);
            return;
        };

        worker.last_heartbeat = now;
        worker.current_task_id = payload.current_task_id;

        let ack = Envelope::new(MessageType::WorkerHeartbeatAck, &HeartbeatAck::default())
            .map(|e| e.with_worker(name.clone()));
        if let Ok(envelope) = ack {
            worker.handle.send_envelope(&envelope);
        }
    }

    /// Remove the worker owning `conn_id`. A connection superseded by a
    /// re-register no longer owns a record and removes nothing.
    pub fn remove_by_conn(&mut self, conn_id: u64) -> Option<(String, Option<String>)> {
        let name = self
            .workers
            .iter()
            .find(|(_, w)| w.conn_id == conn_id)
            .map(|(name, _)| name.clone())?;
        let worker = self.workers.remove(&name)?;
        Some((name, worker.current_task_id))
    }

    /// Sweep workers silent past the watchdog threshold. Expiry is handled
    /// exactly like a socket close; the stale transport is also told to
    /// close.
    pub fn remove_stale(&mut self, now: Instant) -> Vec<(String, Option<String>)> {
        let threshold = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);
        let stale: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| now.duration_since(w.last_heartbeat) >= threshold)
            .map(|(name, _)| name.clone())
            .collect();

        let mut removed = Vec::new();
        for name in stale {
            if let Some(worker) = self.workers.remove(&name) {
                warn!("Removing stale worker '{}': heartbeat silent", name);
                worker.handle.close();
                removed.push((name, worker.current_task_id));
            }
        }
        removed
    }

    /// Select a worker for dispatch: the preferred worker when it is online,
    /// otherwise the next online worker by round-robin over the current
    /// membership.
    pub fn available_worker(&mut self, preferred: Option<&str>) -> Option<String> {
        if let Some(name) = preferred {
            if let Some(worker) = self.workers.get(name) {
                if worker.status.is_available() {
                    return Some(name.to_string());
                }
            }
        }

        if self.workers.is_empty() {
            return None;
        }
        let names: Vec<&String> = self.workers.keys().collect();
        for _ in 0..names.len() {
            let candidate = names[self.round_robin % names.len()];
            self.round_robin = self.round_robin.wrapping_add(1);
            if self.workers[candidate].status.is_available() {
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Serialise and write iff the transport is open. No buffering.
    pub fn send_to_worker(&self, name: &str, envelope: &Envelope) -> bool {
        match self.workers.get(name) {
            Some(worker) => worker.handle.send_envelope(envelope),
            None => false,
        }
    }

    /// Clone of the write half, for tasks that deliver out-of-band frames
    /// (attachment transfers) without holding the registry.
    pub fn handle_for(&self, name: &str) -> Option<WorkerHandle> {
        self.workers.get(name).map(|w| w.handle.clone())
    }

    pub fn mark_busy(&mut self, name: &str, task_id: &str) {
        if let Some(worker) = self.workers.get_mut(name) {
            worker.status = WorkerStatus::Busy;
            worker.current_task_id = Some(task_id.to_string());
        }
    }

    /// Return a worker to Online with no current task.
    pub fn release(&mut self, name: &str) {
        if let Some(worker) = self.workers.get_mut(name) {
            worker.status = WorkerStatus::Online;
            worker.current_task_id = None;
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<WorkerInfo> {
        self.workers.get(name).map(|w| WorkerInfo {
            name: name.to_string(),
            status: w.status,
            current_task_id: w.current_task_id.clone(),
            os: w.os.clone(),
            runtime_version: w.runtime_version.clone(),
            default_cwd: w.default_cwd.clone(),
            allowed_dirs: w.allowed_dirs.clone(),
            connected_at: w.connected_at,
        })
    }

    pub fn snapshots(&self) -> Vec<WorkerInfo> {
        self.workers
            .keys()
            .filter_map(|name| self.snapshot(name))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.workers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Constant-time equality over the shared secret; never short-circuits on a
/// mismatched byte.
fn secrets_match(candidate: &str, expected: &str) -> bool {
    let a = candidate.as_bytes();
    let b = expected.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
