//! Job scheduler (spec.md §4.6, component C6).
//!
//! The periodic tick that walks idle agents and hands them work, plus the
//! no-idle interruption pass that preempts low-priority work when high-
//! priority work is waiting and no agent is free. Grounded directly on the
//! teacher's `layer4/src/scheduler.rs` `Scheduler`: a struct holding the
//! shared queues/registries behind `Arc`, a single background tick driven by
//! `tokio::select!`, and a `RwLock`-guarded shutdown flag — generalised here
//! to a non-blocking single-flight `tokio::sync::Mutex` guard (spec.md §9
//! DESIGN NOTES: "interruption lives inside the scheduler tick but is
//! conceptually a separate pass... implement as two composed passes").

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::benchmark::{self, BenchmarkLookup};
use crate::error::CoreResult;
use crate::events::EventLog;
use crate::filesync::{self, DataDir};
use crate::lifecycle::{self, LifecycleSettings};
use crate::persistence::Store;
use crate::planner;
use crate::platform::telemetry::METRICS;
use crate::rulesplit;
use crate::session::{ServerMessage, SessionRegistry};
use crate::types::{Agent, AgentId, JobExecution, JobStatus, Priority, TaskStatus};

/// The typed counterpart of the `SystemSetting` key-value table (spec.md
/// §3). Parsed once at config-load time; see `platform::config::AppConfig`.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: StdDuration,
    pub housekeeping_interval: StdDuration,
    pub default_chunk_duration_seconds: u32,
    pub chunk_fluctuation_percentage: u32,
    pub job_interruption_enabled: bool,
    pub benchmark_cache_duration_hours: u32,
    pub max_chunk_retry_attempts: u32,
    pub max_job_consecutive_failures: u32,
    pub stale_assignment_timeout: ChronoDuration,
    pub task_reconnect_grace: ChronoDuration,
    pub rule_chunk_temp_dir: PathBuf,
    pub max_job_priority: Priority,
}

impl SchedulerSettings {
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            max_chunk_retry_attempts: self.max_chunk_retry_attempts,
            max_job_consecutive_failures: self.max_job_consecutive_failures,
            stale_assignment_timeout: self.stale_assignment_timeout,
            task_reconnect_grace: self.task_reconnect_grace,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: StdDuration::from_secs(5),
            housekeeping_interval: StdDuration::from_secs(300),
            default_chunk_duration_seconds: 1200,
            chunk_fluctuation_percentage: 20,
            job_interruption_enabled: true,
            benchmark_cache_duration_hours: 168,
            max_chunk_retry_attempts: 3,
            max_job_consecutive_failures: 5,
            stale_assignment_timeout: ChronoDuration::minutes(5),
            task_reconnect_grace: ChronoDuration::minutes(5),
            rule_chunk_temp_dir: PathBuf::from("data/rule_chunks"),
            max_job_priority: 100,
        }
    }
}

/// The job scheduler. Owns no state of its own beyond its settings and the
/// single-flight guard; everything durable lives behind `store`.
pub struct JobScheduler {
    store: Arc<dyn Store>,
    sessions: Arc<SessionRegistry>,
    events: Arc<EventLog>,
    data_dir: DataDir,
    settings: SchedulerSettings,
    tick_lock: tokio::sync::Mutex<()>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: Arc<SessionRegistry>,
        events: Arc<EventLog>,
        data_dir: DataDir,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            sessions,
            events,
            data_dir,
            settings,
            tick_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Runs the periodic tick loop until `shutdown` fires, draining the
    /// current tick before returning (spec.md §5 cancellation contract).
    pub async fn run_tick_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(%err, "scheduler tick failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("scheduler tick loop shutting down");
                    return;
                }
            }
        }
    }

    /// Runs the periodic housekeeping loop (stale-job recovery, stale-busy
    /// cleanup) until `shutdown` fires. Also runs once immediately at
    /// startup (spec.md §4.6 step 3: "every 5 minutes or at startup").
    pub async fn run_housekeeping_loop(self: Arc<Self>, shutdown: CancellationToken) {
        if let Err(err) = self.housekeeping().await {
            warn!(%err, "startup housekeeping failed");
        }
        let mut interval = tokio::time::interval(self.settings.housekeeping_interval);
        interval.tick().await; // discard the immediate first tick, already ran above
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.housekeeping().await {
                        warn!(%err, "housekeeping sweep failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("housekeeping loop shutting down");
                    return;
                }
            }
        }
    }

    /// One scheduler tick (spec.md §4.6). Re-entry while a tick is already
    /// running is skipped rather than queued, matching the single-flight
    /// mutex described in spec.md §5.
    pub async fn tick(&self) -> CoreResult<()> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            return Ok(());
        };

        let idle_agents = self.store.agents_idle().await?;
        let had_idle_at_start = !idle_agents.is_empty();
        for agent in &idle_agents {
            if let Err(err) = self.assign_work(agent).await {
                warn!(agent_id = agent.id, %err, "assign_work failed for agent");
            }
        }

        if !had_idle_at_start {
            self.interruption_pass().await?;
        }

        Ok(())
    }

    /// The no-idle interruption pass (spec.md §4.6 step 2). Only considered
    /// when no agent was idle at tick start: "if at tick start there exists
    /// any idle eligible agent, no running task is interrupted in that
    /// tick" (spec.md §8).
    async fn interruption_pass(&self) -> CoreResult<()> {
        if !self.settings.job_interruption_enabled {
            return Ok(());
        }

        loop {
            let candidates = self.store.pending_jobs_with_high_priority_override().await?;
            let Some(high_priority_job) = candidates.into_iter().next() else {
                return Ok(());
            };

            let active_agents = self.store.count_active_agents_for_job(high_priority_job.id).await?;
            if high_priority_job.max_agents != 0 && active_agents >= high_priority_job.max_agents {
                return Ok(());
            }

            // spec.md §9 open question, resolved to the stricter reading:
            // `interruptible_jobs` already requires `allow_high_priority_override`
            // on the victim's job; the incoming job came from
            // `pending_jobs_with_high_priority_override`, so it's required on
            // both sides.
            let interruptible = self.store.interruptible_jobs(high_priority_job.priority).await?;
            let Some(victim_task) = interruptible.into_iter().next() else {
                return Ok(());
            };
            let Some(victim_agent_id) = victim_task.agent_id else {
                // Shouldn't happen for a `running` task; nothing to interrupt.
                return Ok(());
            };

            let reason = format!("preempted by higher priority job {}", high_priority_job.id);
            if let Some(session) = self.sessions.get(victim_agent_id).await {
                let _ = session
                    .send(ServerMessage::JobStop { task_id: victim_task.id, reason: reason.clone() })
                    .await;
            }
            // Progress already reported stays committed; only the
            // assignment is rolled back (spec.md §4.6 step 2).
            self.store.reset_task_to_pending(victim_task.id).await?;
            METRICS.interruptions_total.inc();
            self.events
                .interruption(victim_task.job_id, victim_task.id, victim_agent_id, &reason)
                .await;
            info!(
                job_id = %victim_task.job_id,
                task_id = %victim_task.id,
                agent_id = victim_agent_id,
                "interrupted running task for higher priority job"
            );

            // The freed agent may now be idle; assign it before looping back
            // to check for further interruption need (spec.md §4.6 step 2:
            // "Re-fetch idle agents; continue with step 1").
            let idle_agents = self.store.agents_idle().await?;
            if !idle_agents.is_empty() {
                for agent in &idle_agents {
                    self.assign_work(agent).await?;
                }
                return Ok(());
            }
        }
    }

    /// `assign_work(agent)` (spec.md §4.6). Tries to hand one chunk of work
    /// to a single idle agent; every early return is a legitimate "nothing
    /// to do this tick" outcome, not an error.
    async fn assign_work(&self, agent: &Agent) -> CoreResult<()> {
        let agent_id = agent.id;
        let mut metadata = agent.metadata.clone();

        // Step 1: stale busy-status metadata (spec.md invariant 9).
        if metadata.busy {
            let valid = match metadata.current_task_id {
                Some(task_id) => self
                    .store
                    .get_task(task_id)
                    .await
                    .map(|t| t.agent_id == Some(agent_id) && matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
                    .unwrap_or(false),
                None => false,
            };
            if !valid {
                metadata.busy = false;
                metadata.current_task_id = None;
                metadata.current_job_id = None;
                self.store.update_agent_metadata(agent_id, metadata.clone()).await?;
            }
        }

        // Step 2: reconnect_pending guard. A busy agent still has a task
        // recovering from a disconnect; a non-busy one should already have
        // been swept back to pending, so we fall through to normal
        // assignment either way.
        let still_reconnecting = self
            .store
            .tasks_by_statuses(&[TaskStatus::ReconnectPending])
            .await?
            .into_iter()
            .any(|t| t.agent_id == Some(agent_id));
        if still_reconnecting && metadata.busy {
            return Ok(());
        }

        // Step 3: pick the next eligible job.
        let candidates = self.store.next_jobs_with_available_work(self.settings.max_job_priority).await?;
        let Some(job) = candidates.into_iter().next() else {
            return Ok(());
        };

        // Step 4: completion guard (spec.md §9 open question: the
        // assignment-side check folds into this general precondition rather
        // than a dedicated branch; the completion handler remains the
        // load-bearing one).
        let hashlist = self.store.get_hashlist(job.hashlist_id).await?;
        if hashlist.fully_cracked() {
            return Ok(());
        }

        // Step 5: forced-benchmark guard for the job's first-ever task.
        if !job.is_accurate_keyspace {
            let existing_tasks = self.store.tasks_by_job(job.id).await?;
            if existing_tasks.is_empty() {
                self.request_benchmark(agent_id, &job, &mut metadata).await?;
                return Ok(());
            }
        }

        // Step 6: file sync. A sync failure is this agent's problem for
        // this tick, not the job's.
        if let Err(err) = self.ensure_synced(&job, None).await {
            warn!(agent_id, job_id = %job.id, %err, "file sync failed, deferring assignment");
            return Ok(());
        }

        // Step 7: benchmark guard.
        let benchmark_key = (agent_id, job.attack_mode, job.hash_type);
        let speed = match benchmark::lookup(
            self.store.as_ref(),
            benchmark_key,
            self.settings.benchmark_cache_duration_hours,
            Utc::now(),
        )
        .await?
        {
            BenchmarkLookup::Fresh(speed) => {
                METRICS.benchmark_cache_hits_total.inc();
                speed
            }
            BenchmarkLookup::NeedsRequest => {
                METRICS.benchmark_cache_misses_total.inc();
                self.request_benchmark(agent_id, &job, &mut metadata).await?;
                return Ok(());
            }
        };

        // Step 8: rule-split decision, made once at first dispatch.
        if !job.uses_rule_splitting && job.multiplication_factor > 1 {
            let existing_tasks = self.store.tasks_by_job(job.id).await?;
            if existing_tasks.is_empty()
                && planner::should_rule_split(
                    job.effective_keyspace,
                    job.multiplication_factor,
                    speed,
                    job.chunk_size_seconds,
                    self.settings.chunk_fluctuation_percentage,
                )
            {
                self.store.set_job_rule_splitting(job.id, true).await?;
                if job.total_rules.is_none() {
                    if let Some(rule_id) = job.rule_ids.first() {
                        let rule_path = self.data_dir.rules().join(rule_id.to_string());
                        let total_rules = rulesplit::count_rules(&rule_path)?;
                        self.store.set_job_total_rules(job.id, total_rules).await?;
                    }
                }
            }
        }
        // Reload: the rule-split decision above may have just changed the
        // job's flags.
        let job = self.store.get_job(job.id).await?;

        // Step 9: prefer picking up an existing task over planning a new
        // chunk, for both rule-split and plain jobs (spec.md §9 DESIGN
        // NOTES: "always go through pending with agent-id cleared; the
        // scheduler's pickup path handles retry_count as a pure bookkeeping
        // field" — read together with Scenario D, which exercises this path
        // for a plain keyspace job, not just a rule-split one).
        if self.pick_up_existing_task(&job, agent_id).await? {
            if job.status == JobStatus::Pending {
                self.store.update_job_status(job.id, JobStatus::Running).await?;
            }
            return Ok(());
        }

        // Step 10: otherwise plan and dispatch a brand new chunk.
        let dispatched = if job.uses_rule_splitting {
            self.dispatch_new_rule_chunk(&job, agent_id, speed).await?
        } else {
            self.dispatch_new_keyspace_chunk(&job, agent_id, speed).await?
        };

        if dispatched {
            // Step 11.
            if job.status == JobStatus::Pending {
                self.store.update_job_status(job.id, JobStatus::Running).await?;
            }
        } else {
            // Planner returned "no remaining keyspace": not an error
            // (spec.md §7); re-check completion since this may be the last
            // outstanding chunk.
            lifecycle::check_job_completion(self.store.as_ref(), job.id).await?;
        }

        Ok(())
    }

    /// Sends a `benchmark_request` unless one is already outstanding for this
    /// agent (spec.md §4.3: a pending marker younger than 5 minutes suppresses
    /// a re-request; once it expires, `benchmark::pending_request_expired`
    /// lets the next tick try again).
    async fn request_benchmark(
        &self,
        agent_id: AgentId,
        job: &JobExecution,
        metadata: &mut crate::types::AgentMetadata,
    ) -> CoreResult<()> {
        let now = Utc::now();
        if metadata.pending_benchmark_job.is_some() && !benchmark::pending_request_expired(metadata, now) {
            return Ok(());
        }
        benchmark::mark_requested(metadata, job.id, now);
        self.store.update_agent_metadata(agent_id, metadata.clone()).await?;
        if let Some(session) = self.sessions.get(agent_id).await {
            let _ = session
                .send(ServerMessage::BenchmarkRequest {
                    job_id: job.id,
                    attack_mode: job.attack_mode,
                    hash_type: job.hash_type,
                    binary_version_id: job.binary_version_id,
                })
                .await;
        }
        Ok(())
    }

    async fn ensure_synced(&self, job: &JobExecution, rule_chunk: Option<&rulesplit::RuleChunk>) -> CoreResult<()> {
        filesync::required_files(&self.data_dir, job, rule_chunk).map(|_| ())
    }

    /// Step 9: tries `retriable_error_task`, then `stale_pending_task`, then
    /// `unassigned_pending_task`, in that preference order. Returns `true`
    /// if a task was found and bound to `agent_id`.
    async fn pick_up_existing_task(&self, job: &JobExecution, agent_id: AgentId) -> CoreResult<bool> {
        if let Some(task) = self.store.retriable_error_task(job.id, self.settings.max_chunk_retry_attempts).await? {
            self.store.increment_task_retry(task.id).await?;
            self.store.reset_task_to_pending(task.id).await?;
            if self.store.assign_task_to_agent(task.id, agent_id).await? {
                self.dispatch_existing(&task, agent_id).await?;
                return Ok(true);
            }
        }

        let stale_cutoff = Utc::now() - self.settings.stale_assignment_timeout;
        if let Some(task) = self.store.stale_pending_task(job.id, stale_cutoff).await? {
            if self.store.assign_task_to_agent(task.id, agent_id).await? {
                self.dispatch_existing(&task, agent_id).await?;
                return Ok(true);
            }
        }

        if let Some(task) = self.store.unassigned_pending_task(job.id).await? {
            if self.store.assign_task_to_agent(task.id, agent_id).await? {
                self.dispatch_existing(&task, agent_id).await?;
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn dispatch_existing(&self, task: &crate::types::JobTask, agent_id: AgentId) -> CoreResult<()> {
        let job = self.store.get_job(task.job_id).await?;
        self.send_job_assignment(task, &job, agent_id).await
    }

    /// Step 10 (plain keyspace path): asks the chunk planner for the next
    /// slice, persists it, and dispatches it. Returns `false` when the
    /// planner reports no remaining keyspace.
    async fn dispatch_new_keyspace_chunk(&self, job: &JobExecution, agent_id: AgentId, speed: f64) -> CoreResult<bool> {
        let chunk_number = self.store.next_chunk_number(job.id).await?;
        let Some(chunk) = planner::plan_next_chunk(
            job.dispatched_keyspace,
            job.effective_keyspace,
            speed,
            job.chunk_size_seconds,
            self.settings.chunk_fluctuation_percentage,
            chunk_number,
        ) else {
            return Ok(false);
        };

        let attack_cmd = build_attack_cmd(job, None);
        let mut task = planner::build_task(job, &chunk, attack_cmd, speed);
        self.store.insert_task(task.clone()).await?;
        if !self.store.assign_task_to_agent(task.id, agent_id).await? {
            // Another assignment raced us onto this agent; leave the task
            // pending for the next tick rather than double-dispatching.
            return Ok(true);
        }
        task.agent_id = Some(agent_id);
        self.send_job_assignment(&task, job, agent_id).await?;
        Ok(true)
    }

    /// Step 10 (rule-split path, component C5): materialises the next rule
    /// chunk and dispatches it.
    async fn dispatch_new_rule_chunk(&self, job: &JobExecution, agent_id: AgentId, speed: f64) -> CoreResult<bool> {
        let Some(total_rules) = job.total_rules else {
            return Ok(false);
        };
        let next_start = self.store.max_rule_end_index(job.id).await?;
        let Some((rule_start, rule_end)) = rulesplit::next_rule_range(
            total_rules,
            next_start,
            job.base_keyspace,
            speed,
            job.chunk_size_seconds,
            self.settings.chunk_fluctuation_percentage,
        ) else {
            return Ok(false);
        };

        let Some(rule_id) = job.rule_ids.first() else {
            return Ok(false);
        };
        let rule_path = self.data_dir.rules().join(rule_id.to_string());
        let chunk = rulesplit::create_single_rule_chunk(
            &self.settings.rule_chunk_temp_dir,
            job.id,
            &rule_path,
            rule_start,
            rule_end - rule_start,
        )?;
        self.ensure_synced(job, Some(&chunk)).await?;

        let chunk_number = self.store.next_chunk_number(job.id).await?;
        let effective_start = job.base_keyspace * rule_start;
        let effective_end = job.base_keyspace * rule_end;
        let attack_cmd = build_attack_cmd(job, Some(&chunk));

        let now = Utc::now();
        let mut task = crate::types::JobTask {
            id: uuid::Uuid::new_v4(),
            job_id: job.id,
            agent_id: None,
            status: TaskStatus::Pending,
            priority: job.priority,
            attack_cmd,
            keyspace_start: effective_start,
            keyspace_end: effective_end,
            keyspace_processed: 0,
            effective_keyspace_start: Some(effective_start),
            effective_keyspace_end: Some(effective_end),
            rule_start_index: Some(chunk.start_index),
            rule_end_index: Some(chunk.end_index),
            rule_chunk_path: Some(chunk.path.to_string_lossy().into_owned()),
            is_rule_split_task: true,
            chunk_number,
            chunk_duration: job.chunk_size_seconds,
            benchmark_speed: Some(speed),
            last_checkpoint: None,
            retry_count: 0,
            assigned_at: None,
            completed_at: None,
            error_message: None,
            progress_percent: 0.0,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_task(task.clone()).await?;
        self.store.increment_job_rule_split_count(job.id).await?;
        if !self.store.assign_task_to_agent(task.id, agent_id).await? {
            return Ok(true);
        }
        task.agent_id = Some(agent_id);
        self.send_job_assignment(&task, job, agent_id).await?;
        Ok(true)
    }

    async fn send_job_assignment(&self, task: &crate::types::JobTask, job: &JobExecution, agent_id: AgentId) -> CoreResult<()> {
        METRICS.tasks_assigned_total.inc();
        if let Some(session) = self.sessions.get(agent_id).await {
            let _ = session
                .send(ServerMessage::JobAssignment {
                    task_id: task.id,
                    job_id: job.id,
                    attack_cmd: task.attack_cmd.clone(),
                    keyspace_start: task.keyspace_start,
                    keyspace_end: task.keyspace_end,
                    rule_chunk_path: task.rule_chunk_path.clone(),
                    binary_version_id: job.binary_version_id,
                })
                .await;
        }
        Ok(())
    }

    /// `recover_stale_jobs` + `cleanup_stale_agent_status` (spec.md §4.7).
    pub async fn housekeeping(&self) -> CoreResult<()> {
        lifecycle::recover_stale_jobs(self.store.as_ref(), self.settings.lifecycle_settings(), Utc::now()).await?;
        lifecycle::cleanup_stale_agent_status(self.store.as_ref()).await?;
        Ok(())
    }
}

/// Builds the opaque attack command line dispatched to the agent's hashcat
/// driver (out of scope: spec.md §1 names only the contract the core
/// consumes back). This is a thin placeholder assembling the handful of
/// parameters the core itself tracks; the real command construction (mask
/// syntax, device selection flags, etc.) lives in the agent, not here.
fn build_attack_cmd(job: &JobExecution, rule_chunk: Option<&rulesplit::RuleChunk>) -> String {
    let mut cmd = format!("-a {} -m {} -O", job.attack_mode, job.hash_type);
    if let Some(chunk) = rule_chunk {
        cmd.push_str(&format!(" -r {}", chunk.path.display()));
    }
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemStore;
    use crate::types::{AgentMetadata, AgentStatus, Hashlist, JobExecution};
    use uuid::Uuid;

    fn settings() -> SchedulerSettings {
        SchedulerSettings::default()
    }

    fn sample_job(hashlist_id: uuid::Uuid, priority: Priority) -> JobExecution {
        let now = Utc::now();
        JobExecution {
            id: Uuid::new_v4(),
            name: "job".into(),
            status: JobStatus::Pending,
            priority,
            max_agents: 0,
            allow_high_priority_override: true,
            hashlist_id,
            attack_mode: 3,
            hash_type: 1000,
            binary_version_id: Uuid::new_v4(),
            wordlist_ids: vec![],
            rule_ids: vec![],
            base_keyspace: 10_000,
            multiplication_factor: 1,
            effective_keyspace: 10_000,
            total_keyspace: 10_000,
            dispatched_keyspace: 0,
            processed_keyspace: 0,
            is_accurate_keyspace: true,
            uses_rule_splitting: false,
            rule_split_count: 0,
            total_rules: None,
            chunk_size_seconds: 20,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_agent(id: AgentId) -> Agent {
        let now = Utc::now();
        Agent {
            id,
            name: format!("agent-{id}"),
            owner: "tester".into(),
            status: AgentStatus::Active,
            last_heartbeat: Some(now),
            last_seen_ip: None,
            version: "1.0".into(),
            extra_parameters: String::new(),
            metadata: AgentMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    async fn scheduler_with(store: Arc<MemStore>) -> JobScheduler {
        JobScheduler::new(
            store,
            Arc::new(SessionRegistry::new()),
            Arc::new(EventLog::default()),
            DataDir::new(std::env::temp_dir()),
            settings(),
        )
    }

    #[tokio::test]
    async fn scenario_a_single_chunk_fits_one_task() {
        let store = Arc::new(MemStore::new());
        let hashlist = Hashlist {
            id: Uuid::new_v4(),
            name: "h".into(),
            hash_type: 1000,
            total_hashes: 1000,
            cracked_hashes: 0,
            file_path: "h.txt".into(),
        };
        store.insert_hashlist(hashlist.clone()).await.unwrap();
        let job = sample_job(hashlist.id, 0);
        store.insert_job(job.clone()).await.unwrap();
        let agent = sample_agent(1);
        store.insert_agent(agent.clone()).await.unwrap();
        store
            .upsert_benchmark(crate::types::BenchmarkEntry {
                agent_id: 1,
                attack_mode: 3,
                hash_type: 1000,
                speed: 1000.0,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let scheduler = scheduler_with(store.clone()).await;
        scheduler.tick().await.unwrap();

        let tasks = store.tasks_by_job(job.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].keyspace_start, 0);
        assert_eq!(tasks[0].keyspace_end, 10_000);
        assert_eq!(tasks[0].agent_id, Some(1));
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn no_idle_agents_means_no_interruption() {
        // Scenario C's converse (spec.md §8): with an idle agent present,
        // nothing gets interrupted even if a higher priority job exists.
        let store = Arc::new(MemStore::new());
        let hashlist_low = Hashlist {
            id: Uuid::new_v4(),
            name: "low".into(),
            hash_type: 1000,
            total_hashes: 1000,
            cracked_hashes: 0,
            file_path: "low.txt".into(),
        };
        let hashlist_hi = Hashlist {
            id: Uuid::new_v4(),
            name: "hi".into(),
            hash_type: 1000,
            total_hashes: 1000,
            cracked_hashes: 0,
            file_path: "hi.txt".into(),
        };
        store.insert_hashlist(hashlist_low.clone()).await.unwrap();
        store.insert_hashlist(hashlist_hi.clone()).await.unwrap();

        let low_job = sample_job(hashlist_low.id, 10);
        store.insert_job(low_job.clone()).await.unwrap();
        let hi_job = sample_job(hashlist_hi.id, 90);
        store.insert_job(hi_job.clone()).await.unwrap();

        let busy_agent = sample_agent(1);
        store.insert_agent(busy_agent.clone()).await.unwrap();
        let idle_agent = sample_agent(2);
        store.insert_agent(idle_agent.clone()).await.unwrap();

        for agent_id in [1, 2] {
            store
                .upsert_benchmark(crate::types::BenchmarkEntry {
                    agent_id,
                    attack_mode: 3,
                    hash_type: 1000,
                    speed: 1000.0,
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        // Give the low-priority job a running task on agent 1 by ticking
        // against only that job first.
        let chunk = planner::PlannedChunk { keyspace_start: 0, keyspace_end: 10_000, chunk_number: 0 };
        let mut low_task = planner::build_task(&low_job, &chunk, "hashcat".into(), 1000.0);
        store.insert_task(low_task.clone()).await.unwrap();
        store.assign_task_to_agent(low_task.id, 1).await.unwrap();
        low_task.status = TaskStatus::Running;
        store.mark_task_running(low_task.id).await.unwrap();

        let scheduler = scheduler_with(store.clone()).await;
        scheduler.tick().await.unwrap();

        // Agent 2 was idle, so the high priority job is assigned without
        // touching agent 1's task.
        let low_task_after = store.get_task(low_task.id).await.unwrap();
        assert_eq!(low_task_after.status, TaskStatus::Running);
        let hi_tasks = store.tasks_by_job(hi_job.id).await.unwrap();
        assert_eq!(hi_tasks.len(), 1);
        assert_eq!(hi_tasks[0].agent_id, Some(2));
    }
}
