//! Agent session (spec.md §4.2, component C2).
//!
//! One logical bidirectional channel per connected agent, transported over
//! an Axum WebSocket. A reader task delivers framed messages to dispatch
//! handlers; a writer task drains an outbound queue so assignments and stops
//! for a given agent are applied in FIFO order (spec.md §5). This mirrors
//! the teacher's single-writer-per-connection shape in
//! `platform/telemetry.rs` and `layer4/src/executor.rs`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{AgentId, Device, JobId, TaskId};

/// Heartbeat ping period (spec.md §4.2, §5).
pub const PING_PERIOD: Duration = Duration::from_secs(54);
/// How long to wait for a pong before declaring the session dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a single outbound frame write may take before the session is
/// considered stalled.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages the session consumes FROM an agent (spec.md §4.2).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        devices: Vec<DeviceDetected>,
    },
    DeviceDetected {
        devices: Vec<DeviceDetected>,
    },
    Heartbeat {
        cpu_percent: Option<f32>,
        mem_percent: Option<f32>,
    },
    BenchmarkResult {
        attack_mode: i32,
        hash_type: i32,
        binary_version_id: Uuid,
        speed: f64,
    },
    TaskProgress {
        task_id: TaskId,
        keyspace_processed: u64,
        effective_progress: f32,
        hash_rate: f64,
        progress_percent: f32,
        device_metrics: Vec<(i32, f32)>,
        actual_effective_keyspace: Option<u64>,
    },
    CrackFound {
        task_id: TaskId,
        hash_id: Uuid,
        plaintext: String,
    },
    TaskResult {
        task_id: TaskId,
        exit_status: i32,
        all_hashes_cracked: bool,
        error: Option<String>,
    },
    FileRequest {
        correlation_id: Uuid,
        sha256: String,
    },
    BusyStatus {
        busy: bool,
        task_id: Option<TaskId>,
    },
}

/// Device inventory entry as reported by `hello`/`device_detected`.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDetected {
    pub id: i32,
    pub kind: crate::types::DeviceKind,
    pub name: String,
    pub memory_mb: u64,
    pub backend: String,
    pub is_alias: bool,
}

impl DeviceDetected {
    pub fn into_device(self, agent_id: AgentId) -> Device {
        Device {
            id: self.id,
            agent_id,
            kind: self.kind,
            name: self.name,
            memory_mb: self.memory_mb,
            backend: self.backend,
            is_alias: self.is_alias,
            enabled: true,
        }
    }
}

/// Messages the session sends TO an agent (spec.md §4.2).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JobAssignment {
        task_id: TaskId,
        job_id: JobId,
        attack_cmd: String,
        keyspace_start: u64,
        keyspace_end: u64,
        rule_chunk_path: Option<String>,
        binary_version_id: Uuid,
    },
    BenchmarkRequest {
        job_id: JobId,
        attack_mode: i32,
        hash_type: i32,
        binary_version_id: Uuid,
    },
    JobStop {
        task_id: TaskId,
        reason: String,
    },
    FileChunk {
        correlation_id: Uuid,
        sha256: String,
        offset: u64,
        data: Vec<u8>,
        is_final: bool,
    },
}

/// A connected agent's outbound half: a bounded FIFO queue drained by the
/// session's writer task, plus the bookkeeping needed to detect a dead
/// connection.
pub struct AgentSession {
    pub agent_id: AgentId,
    outbound: mpsc::Sender<ServerMessage>,
    pub connected_at: DateTime<Utc>,
    pub last_pong: Arc<RwLock<Instant>>,
}

impl AgentSession {
    /// Enqueues an outbound message, preserving FIFO order for this agent
    /// (spec.md §4.2, §5). Closing the session makes this return
    /// `SessionClosed` so callers can roll the in-flight assignment back.
    pub async fn send(&self, message: ServerMessage) -> CoreResult<()> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| CoreError::SessionClosed(self.agent_id))
    }
}

/// Registry of all connected agent sessions, keyed by agent id. Cross-agent
/// handlers run in parallel (spec.md §5); this registry only serialises
/// access to the map itself.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<AgentId, Arc<AgentSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, agent_id: AgentId, outbound: mpsc::Sender<ServerMessage>) -> Arc<AgentSession> {
        let session = Arc::new(AgentSession {
            agent_id,
            outbound,
            connected_at: Utc::now(),
            last_pong: Arc::new(RwLock::new(Instant::now())),
        });
        self.sessions.write().await.insert(agent_id, session.clone());
        session
    }

    pub async fn remove(&self, agent_id: AgentId) {
        self.sessions.write().await.remove(&agent_id);
    }

    pub async fn get(&self, agent_id: AgentId) -> Option<Arc<AgentSession>> {
        self.sessions.read().await.get(&agent_id).cloned()
    }

    pub async fn is_connected(&self, agent_id: AgentId) -> bool {
        self.sessions.read().await.contains_key(&agent_id)
    }

    pub async fn connected_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Drives one agent's WebSocket connection: a writer loop that drains the
/// outbound queue (applying `WRITE_TIMEOUT`) and pings on `PING_PERIOD`, and
/// a reader loop that deserialises inbound frames and hands them to
/// `on_message`. Returns when the socket closes or the pong times out.
///
/// `on_message` runs handlers for a single agent sequentially (spec.md §5:
/// "handlers for a given agent do not race each other"), since both loops
/// share one socket split and messages are processed as they're read.
pub async fn drive_session<F, Fut>(
    socket: WebSocket,
    agent_id: AgentId,
    registry: Arc<SessionRegistry>,
    mut on_message: F,
) where
    F: FnMut(ClientMessage) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    use futures::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(64);
    let session = registry.register(agent_id, tx).await;
    info!(agent_id, "agent session established");

    let mut ping_interval = tokio::time::interval(PING_PERIOD);
    ping_interval.tick().await; // first tick fires immediately; discard it

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(message) => {
                        let Ok(text) = serde_json::to_string(&message) else { continue };
                        if tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(text))).await.is_err() {
                            warn!(agent_id, "write timeout, closing session");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Ping(vec![]))).await.is_err() {
                    warn!(agent_id, "ping write timeout, closing session");
                    break;
                }
                let last_pong = *session.last_pong.read().await;
                if last_pong.elapsed() > PONG_TIMEOUT {
                    warn!(agent_id, "pong timeout, closing session");
                    break;
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => on_message(message).await,
                            Err(err) => warn!(agent_id, %err, "dropping malformed frame"),
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        *session.last_pong.write().await = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(agent_id, %err, "session read error");
                        break;
                    }
                }
            }
        }
    }

    registry.remove(agent_id).await;
    info!(agent_id, "agent session closed");
}

/// Chunk size used when streaming a `file_chunk` response to a `file_request`
/// (spec.md §4.2, §4.8). Small enough to keep individual writes under
/// `WRITE_TIMEOUT` on a slow link.
const FILE_CHUNK_BYTES: usize = 256 * 1024;

/// Dispatches one inbound `ClientMessage` (spec.md §4.2) to the component
/// that owns its semantics. This is the session layer's half of the
/// contract: "Messages the session consumes FROM agent" lists exactly these
/// cases, each handed to the benchmark cache, the task lifecycle, or the
/// file-sync service in turn.
pub async fn handle_message(
    store: &dyn crate::persistence::Store,
    events: &crate::events::EventLog,
    sessions: &SessionRegistry,
    data_dir: &crate::filesync::DataDir,
    lifecycle_settings: crate::lifecycle::LifecycleSettings,
    agent_id: AgentId,
    message: ClientMessage,
) {
    let now = Utc::now();
    let result = match message {
        ClientMessage::Hello { devices } | ClientMessage::DeviceDetected { devices } => {
            handle_devices(store, agent_id, devices, now).await
        }
        ClientMessage::Heartbeat { .. } => store.update_agent_heartbeat(agent_id, None).await.and(
            store.update_agent_status(agent_id, crate::types::AgentStatus::Active).await,
        ),
        ClientMessage::BenchmarkResult { attack_mode, hash_type, speed, .. } => {
            crate::benchmark::record_result(store, agent_id, attack_mode, hash_type, speed, now).await
        }
        ClientMessage::TaskProgress { task_id, keyspace_processed, progress_percent, actual_effective_keyspace, .. } => {
            crate::lifecycle::record_progress(store, task_id, keyspace_processed, progress_percent, actual_effective_keyspace, now).await
        }
        ClientMessage::CrackFound { task_id, hash_id, plaintext } => handle_crack(store, events, sessions, task_id, hash_id, plaintext, now).await,
        ClientMessage::TaskResult { task_id, exit_status, all_hashes_cracked, error } => {
            handle_task_result(store, events, sessions, lifecycle_settings, task_id, exit_status, all_hashes_cracked, error, now).await
        }
        ClientMessage::FileRequest { correlation_id, sha256 } => {
            handle_file_request(sessions, data_dir, agent_id, correlation_id, sha256).await
        }
        ClientMessage::BusyStatus { busy, task_id } => handle_busy_status(store, agent_id, busy, task_id).await,
    };
    if let Err(err) = result {
        warn!(agent_id, %err, "error handling inbound agent message");
    }
}

async fn handle_devices(
    store: &dyn crate::persistence::Store,
    agent_id: AgentId,
    devices: Vec<DeviceDetected>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    // Alias devices double-count a physical GPU under OpenCL and CUDA and
    // are filtered out of scheduling input (spec.md §4.2).
    let devices = devices
        .into_iter()
        .filter(|d| !d.is_alias)
        .map(|d| d.into_device(agent_id))
        .collect();
    store.upsert_devices(agent_id, devices).await?;
    store.update_agent_heartbeat(agent_id, None).await?;
    store.update_agent_status(agent_id, crate::types::AgentStatus::Active).await?;
    let _ = now;
    Ok(())
}

async fn handle_crack(
    store: &dyn crate::persistence::Store,
    events: &crate::events::EventLog,
    sessions: &SessionRegistry,
    task_id: TaskId,
    hash_id: Uuid,
    plaintext: String,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let task = store.get_task(task_id).await?;
    let job = store.get_job(task.job_id).await?;
    let crack = crate::types::Crack {
        hash_id,
        hashlist_id: job.hashlist_id,
        plaintext,
        task_id,
        cracked_at: now,
    };
    let fully_cracked = crate::lifecycle::record_crack(store, crack).await?;
    if fully_cracked {
        crate::lifecycle::handle_hashlist_complete(store, events, sessions, job.hashlist_id).await?;
    }
    Ok(())
}

async fn handle_task_result(
    store: &dyn crate::persistence::Store,
    events: &crate::events::EventLog,
    sessions: &SessionRegistry,
    settings: crate::lifecycle::LifecycleSettings,
    task_id: TaskId,
    exit_status: i32,
    all_hashes_cracked: bool,
    error: Option<String>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    // Exit status 6 = all hashes cracked; trusted regardless of the flag the
    // agent also sets (spec.md §4.2, §4.7).
    if all_hashes_cracked || exit_status == 6 {
        return crate::lifecycle::handle_all_hashes_cracked(store, events, sessions, task_id, now).await;
    }
    if exit_status == 0 {
        crate::lifecycle::complete_task(store, task_id, now).await
    } else {
        crate::lifecycle::fail_task(store, events, settings, task_id, error.unwrap_or_else(|| format!("hashcat exited {exit_status}"))).await
    }
}

async fn handle_file_request(
    sessions: &SessionRegistry,
    data_dir: &crate::filesync::DataDir,
    agent_id: AgentId,
    correlation_id: Uuid,
    sha256: String,
) -> CoreResult<()> {
    let Some(session) = sessions.get(agent_id).await else {
        return Ok(());
    };
    let Some(path) = crate::filesync::find_by_sha256(data_dir, &sha256)? else {
        warn!(agent_id, sha256, "file_request for unknown content hash");
        return Ok(());
    };
    let data = std::fs::read(&path)?;
    if data.is_empty() {
        let _ = session
            .send(ServerMessage::FileChunk { correlation_id, sha256, offset: 0, data: Vec::new(), is_final: true })
            .await;
        return Ok(());
    }
    let mut offset = 0usize;
    while offset < data.len() {
        let end = (offset + FILE_CHUNK_BYTES).min(data.len());
        let is_final = end == data.len();
        session
            .send(ServerMessage::FileChunk {
                correlation_id,
                sha256: sha256.clone(),
                offset: offset as u64,
                data: data[offset..end].to_vec(),
                is_final,
            })
            .await?;
        offset = end;
    }
    Ok(())
}

async fn handle_busy_status(store: &dyn crate::persistence::Store, agent_id: AgentId, busy: bool, task_id: Option<TaskId>) -> CoreResult<()> {
    let mut agent = store.get_agent(agent_id).await?;
    agent.metadata.busy = busy;
    agent.metadata.current_task_id = task_id;
    store.update_agent_metadata(agent_id, agent.metadata).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_tracks_connected_agents() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        registry.register(1, tx).await;
        assert!(registry.is_connected(1).await);
        assert_eq!(registry.connected_count().await, 1);
        registry.remove(1).await;
        assert!(!registry.is_connected(1).await);
    }

    #[tokio::test]
    async fn send_after_drop_reports_session_closed() {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let session = registry.register(1, tx).await;
        drop(rx);
        let result = session
            .send(ServerMessage::JobStop { task_id: Uuid::new_v4(), reason: "test".into() })
            .await;
        assert!(matches!(result, Err(CoreError::SessionClosed(1))));
    }
}
