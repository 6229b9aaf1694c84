//! Core data model (spec.md §3).
//!
//! These are the durable entities the scheduling core reasons about. Agents
//! use small monotonic integers as ids (cheap to log, cheap to index);
//! everything else uses a 128-bit opaque id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Opaque 128-bit identifier used for jobs and tasks.
pub type JobId = Uuid;
/// Opaque 128-bit identifier used for jobs and tasks.
pub type TaskId = Uuid;
/// Opaque 128-bit identifier used for hashlists.
pub type HashlistId = Uuid;
/// Monotonically assigned small integer identifying a connected agent.
pub type AgentId = i64;

/// Job priority. Higher values are scheduled first; bounds are enforced at
/// admission time against `max_job_priority` (spec.md §4.6, §9 open question:
/// 0 is a valid "minimal" priority, there is no separate lower bound).
pub type Priority = i32;

/// Lifecycle states of a connected agent (spec.md §3 "Agent").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum AgentStatus {
    /// Registered via a voucher but has not sent its first heartbeat yet.
    Pending,
    /// Has sent at least one heartbeat within the timeout window.
    Active,
    /// Missed its heartbeat deadline; session has been closed.
    Inactive,
    /// Administratively disabled; excluded from scheduling.
    Disabled,
    /// Hit a permanent error condition (repeated benchmark failures, decode
    /// failures); excluded from scheduling until an admin re-enables it.
    Error,
}

/// Class of a detected compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum DeviceKind {
    Gpu,
    Cpu,
}

/// One GPU/CPU device detected on an agent at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i32,
    pub agent_id: AgentId,
    pub kind: DeviceKind,
    pub name: String,
    pub memory_mb: u64,
    pub backend: String,
    /// True for hashcat's synthetic "alias" devices that double-count a
    /// physical GPU under OpenCL and CUDA; filtered out of scheduling input.
    pub is_alias: bool,
    pub enabled: bool,
}

/// Typed replacement for the stringly `key -> String` agent metadata map
/// (spec.md §9 DESIGN NOTES item 1). Persisted as one JSON column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Advisory self-reported busy flag. The authoritative source of
    /// busy-ness is always the existence of an {assigned, running} task for
    /// this agent (spec.md invariant 9); this field exists only to carry
    /// "agent thinks it crashed mid-run" hints across a stale-busy sweep.
    pub busy: bool,
    pub current_task_id: Option<TaskId>,
    pub current_job_id: Option<JobId>,
    pub pending_benchmark_job: Option<JobId>,
    pub benchmark_requested_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// A connected or previously-connected agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub owner: String,
    pub status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_seen_ip: Option<String>,
    pub version: String,
    pub extra_parameters: String,
    pub metadata: AgentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a `JobExecution` (spec.md §3 lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// A unit of dispatchable work: one hashlist cracked with one attack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub priority: Priority,
    /// 0 means unlimited concurrent agents.
    pub max_agents: u32,
    pub allow_high_priority_override: bool,
    pub hashlist_id: HashlistId,
    pub attack_mode: i32,
    pub hash_type: i32,
    pub binary_version_id: Uuid,
    pub wordlist_ids: Vec<Uuid>,
    pub rule_ids: Vec<Uuid>,

    /// Raw candidate count before rule multiplication.
    pub base_keyspace: u64,
    /// Rule multiplication factor (1 for straight attacks without rules).
    pub multiplication_factor: u64,
    /// `base_keyspace * multiplication_factor`. The gate for completion on
    /// non-rule-split jobs.
    pub effective_keyspace: u64,
    /// Legacy/simple total, used only when a job has no rule component and
    /// effective_keyspace tracking hasn't kicked in yet.
    pub total_keyspace: u64,

    /// Cumulative size of keyspace chunks reserved (committed, not
    /// necessarily processed). Only the chunk planner writes this, via an
    /// atomic increment inside the task-creation transaction.
    pub dispatched_keyspace: u64,
    /// Cumulative size of keyspace chunks actually processed, as reported by
    /// agents. `processed_keyspace <= dispatched_keyspace` always.
    pub processed_keyspace: u64,
    /// Becomes true once a real benchmark-derived keyspace has superseded the
    /// estimate used at job creation (spec.md §4.2, §4.3).
    pub is_accurate_keyspace: bool,

    pub uses_rule_splitting: bool,
    pub rule_split_count: u32,
    /// Total rule count for a rule-split job, once known (spec.md §4.5).
    /// `None` until the rule-split manager has counted the rule file.
    pub total_rules: Option<u64>,

    pub chunk_size_seconds: u32,
    pub consecutive_failures: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a `JobTask` (spec.md §3 lifecycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// The owning agent disconnected; the task is waiting out the reconnect
    /// grace period before being swept back to `Pending`.
    ReconnectPending,
}

impl TaskStatus {
    /// Non-terminal statuses count toward the single-slot-agent invariant
    /// and toward `incomplete_tasks_count`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// One chunk of work dispatched to one agent at one time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobTask {
    pub id: TaskId,
    pub job_id: JobId,
    pub agent_id: Option<AgentId>,
    pub status: TaskStatus,
    /// Copied from the owning job at creation time (spec.md invariant 8);
    /// priority changes on the job do not retroactively reorder this task.
    pub priority: Priority,
    /// Opaque command line dispatched to the agent's hashcat driver.
    pub attack_cmd: String,

    pub keyspace_start: u64,
    pub keyspace_end: u64,
    pub keyspace_processed: u64,

    pub effective_keyspace_start: Option<u64>,
    pub effective_keyspace_end: Option<u64>,

    pub rule_start_index: Option<u64>,
    pub rule_end_index: Option<u64>,
    pub rule_chunk_path: Option<String>,
    pub is_rule_split_task: bool,

    pub chunk_number: u32,
    pub chunk_duration: u32,
    pub benchmark_speed: Option<f64>,
    pub last_checkpoint: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub assigned_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub progress_percent: f32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobTask {
    /// Size of this task's raw keyspace slice.
    pub fn keyspace_len(&self) -> u64 {
        self.keyspace_end.saturating_sub(self.keyspace_start)
    }
}

/// A set of target hashes plus its file on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hashlist {
    pub id: HashlistId,
    pub name: String,
    pub hash_type: i32,
    pub total_hashes: i64,
    pub cracked_hashes: i64,
    pub file_path: String,
}

impl Hashlist {
    /// True once every hash in this hashlist has a recorded crack
    /// (spec.md invariant 7).
    pub fn fully_cracked(&self) -> bool {
        self.cracked_hashes >= self.total_hashes
    }
}

/// A cracked hash, attributable to the task that found it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crack {
    pub hash_id: Uuid,
    pub hashlist_id: HashlistId,
    pub plaintext: String,
    pub task_id: TaskId,
    pub cracked_at: DateTime<Utc>,
}

/// Measured hash rate for one (agent, attack-mode, hash-type) combination
/// (spec.md §3 "Benchmark", §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkEntry {
    pub agent_id: AgentId,
    pub attack_mode: i32,
    pub hash_type: i32,
    /// Hashes per second.
    pub speed: f64,
    pub updated_at: DateTime<Utc>,
}

/// Key used to look up a benchmark.
pub type BenchmarkKey = (AgentId, i32, i32);

/// Recognised `SystemSetting` keys (spec.md §3). The typed, validated
/// counterpart lives in `platform::config::SchedulerSettings`; this is kept
/// only to document the persisted key names the admin HTTP surface writes.
pub const SYSTEM_SETTING_KEYS: &[&str] = &[
    "default_chunk_duration",
    "chunk_fluctuation_percentage",
    "job_interruption_enabled",
    "benchmark_cache_duration_hours",
    "max_chunk_retry_attempts",
    "agent_hashlist_retention_hours",
    "progress_reporting_interval",
    "rule_split_enabled",
    "rule_split_min_rules",
    "rule_split_max_chunks",
    "rule_chunk_temp_dir",
    "max_job_priority",
];

/// A file-sync manifest entry: one content-addressed file an agent needs for
/// a task (spec.md §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFile {
    pub kind: SyncFileKind,
    pub logical_name: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub local_path: String,
}

/// The class of file a task may need synced to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncFileKind {
    Hashlist,
    Wordlist,
    Rules,
    RuleChunk,
    Binary,
}

/// Extra per-task bookkeeping the scheduler needs but doesn't fit neatly into
/// `JobTask` (kept separate so `JobTask` mirrors the persisted row exactly).
#[derive(Debug, Clone, Default)]
pub struct DeviceMetrics {
    pub per_device: HashMap<i32, f32>,
}
