//! Task lifecycle (spec.md §4.7, component C7).
//!
//! Progress ingestion, crack ingestion, task termination, the hashlist
//! completion handler, and the stale-state recovery sweeps. The job
//! completion check is factored into one function with one call site
//! (spec.md §9 DESIGN NOTES: "make this a function with a single call site
//! factored out of both paths") and is invoked both after every task
//! termination and after a planner "no remaining keyspace" result.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::error::CoreResult;
use crate::events::EventLog;
use crate::persistence::Store;
use crate::session::{ServerMessage, SessionRegistry};
use crate::types::{AgentId, AgentStatus, Crack, HashlistId, JobId, JobStatus, TaskId, TaskStatus};

/// Settings the lifecycle sweeps and termination handlers need. A subset of
/// `platform::config::SchedulerSettings`, passed by value to keep this
/// module free of a dependency on the config layer.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub max_chunk_retry_attempts: u32,
    pub max_job_consecutive_failures: u32,
    pub stale_assignment_timeout: Duration,
    pub task_reconnect_grace: Duration,
}

/// Applies an incoming `task_progress` message (spec.md §4.2, §4.7).
///
/// `actual_effective_keyspace`, when present, is authoritative only on the
/// first progress update for a task (spec.md §4.2): it supersedes the
/// planner's estimate and marks the owning job `is_accurate_keyspace=true`.
/// Progress counters are SET to the reported cumulative value, not added, so
/// replaying the same message twice is a no-op (spec.md §8 idempotence).
pub async fn record_progress(
    store: &dyn Store,
    task_id: TaskId,
    keyspace_processed: u64,
    progress_percent: f32,
    actual_effective_keyspace: Option<u64>,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let task = store.get_task(task_id).await?;
    if task.status.is_terminal() {
        // A late progress message for a terminated task is dropped (spec.md §4.2).
        return Ok(());
    }
    if task.status == TaskStatus::Assigned {
        // The protocol has no explicit ack; the first progress report after
        // dispatch is what actually observes the agent running the task.
        store.mark_task_running(task_id).await?;
    }
    let is_first_update = task.last_checkpoint.is_none();
    store
        .record_task_progress(task_id, keyspace_processed, progress_percent, now)
        .await?;
    if is_first_update {
        if let Some(actual) = actual_effective_keyspace {
            let end = task.effective_keyspace_start.unwrap_or(task.keyspace_start) + actual;
            store.set_task_effective_keyspace_end(task_id, end).await?;
            store.mark_job_accurate_keyspace(task.job_id).await?;
        }
    }
    Ok(())
}

/// Applies an incoming `crack_found` message (spec.md §4.7). Returns `true`
/// when the hashlist just became fully cracked, signalling the caller to run
/// `handle_hashlist_complete`.
pub async fn record_crack(store: &dyn Store, crack: Crack) -> CoreResult<bool> {
    let hashlist_id = crack.hashlist_id;
    store.insert_crack(crack).await?;
    let hashlist = store.increment_cracked(hashlist_id, 1).await?;
    Ok(hashlist.fully_cracked())
}

/// Marks a task `completed`, resetting both failure counters to zero
/// (spec.md §4.7), then runs the job-completion check.
pub async fn complete_task(store: &dyn Store, task_id: TaskId, completed_at: DateTime<Utc>) -> CoreResult<()> {
    let task = store.get_task(task_id).await?;
    store.complete_task(task_id, completed_at).await?;
    store.reset_job_consecutive_failures(task.job_id).await?;
    if let Some(agent_id) = task.agent_id {
        store.reset_agent_consecutive_failures(agent_id).await?;
    }
    check_job_completion(store, task.job_id).await
}

/// Marks a task `failed`, incrementing job and agent failure counters and
/// deciding retry eligibility (spec.md §4.7, §7).
pub async fn fail_task(
    store: &dyn Store,
    events: &EventLog,
    settings: LifecycleSettings,
    task_id: TaskId,
    error_message: String,
) -> CoreResult<()> {
    let task = store.get_task(task_id).await?;
    store.fail_task(task_id, error_message).await?;
    let job_failures = store.increment_job_consecutive_failures(task.job_id).await?;
    if let Some(agent_id) = task.agent_id {
        store.increment_agent_consecutive_failures(agent_id).await?;
    }
    if job_failures > settings.max_job_consecutive_failures {
        warn!(job_id = %task.job_id, job_failures, "job exceeded consecutive failure threshold");
        store.update_job_status(task.job_id, JobStatus::Failed).await?;
        events
            .job_failed(task.job_id, &format!("exceeded {} consecutive failures", settings.max_job_consecutive_failures))
            .await;
    }
    // Retry eligibility (retry_count < max_chunk_retry_attempts) is read back
    // by the scheduler's `retriable_error_task` query on the next tick; no
    // state transition happens here beyond recording the failure.
    let _ = settings.max_chunk_retry_attempts;
    Ok(())
}

/// Marks a task `cancelled`. Terminal; no retry (spec.md §4.7).
pub async fn cancel_task(store: &dyn Store, task_id: TaskId) -> CoreResult<()> {
    store.cancel_task(task_id).await
}

/// Handles the trusted `all_hashes_cracked=true` signal (hashcat exit status
/// 6): the reporting task completes, and the hashlist-completion handler
/// runs regardless of whether `hashlist.cracked_hashes` itself reached
/// `total_hashes` through individually reported cracks.
pub async fn handle_all_hashes_cracked(
    store: &dyn Store,
    events: &EventLog,
    sessions: &SessionRegistry,
    task_id: TaskId,
    completed_at: DateTime<Utc>,
) -> CoreResult<()> {
    let task = store.get_task(task_id).await?;
    store.complete_task(task_id, completed_at).await?;
    let job = store.get_job(task.job_id).await?;
    handle_hashlist_complete(store, events, sessions, job.hashlist_id).await
}

/// The hashlist-completion handler (spec.md §4.7). Idempotent: running it
/// again on an already-handled hashlist finds no running tasks and no
/// pending jobs left to touch.
pub async fn handle_hashlist_complete(
    store: &dyn Store,
    events: &EventLog,
    sessions: &SessionRegistry,
    hashlist_id: HashlistId,
) -> CoreResult<()> {
    let now = Utc::now();

    for task in store.running_tasks_for_hashlist(hashlist_id).await? {
        if let Some(agent_id) = task.agent_id {
            if let Some(session) = sessions.get(agent_id).await {
                let _ = session
                    .send(ServerMessage::JobStop { task_id: task.id, reason: "hashlist fully cracked".into() })
                    .await;
            }
        }
        store.complete_task(task.id, now).await?;
        store.update_job_status(task.job_id, JobStatus::Completed).await?;
        info!(job_id = %task.job_id, task_id = %task.id, "stopped for hashlist completion");
    }

    for job in store.pending_jobs_for_hashlist(hashlist_id).await? {
        store.delete_job(job.id).await?;
    }

    // `JobId` and `HashlistId` are both opaque `Uuid`s; the completion event
    // is keyed on the hashlist since it isn't scoped to a single job.
    events.completion(hashlist_id).await;
    Ok(())
}

/// The job-completion check (spec.md §4.6 step after each termination, §9
/// DESIGN NOTES). Must be idempotent and is the single call site both
/// `complete_task` and the scheduler's "no remaining keyspace" planner
/// result route through.
pub async fn check_job_completion(store: &dyn Store, job_id: JobId) -> CoreResult<()> {
    let job = store.get_job(job_id).await?;
    if job.status == JobStatus::Completed || job.status == JobStatus::Cancelled {
        return Ok(());
    }
    let incomplete = store.incomplete_tasks_count(job_id).await?;
    if incomplete != 0 {
        return Ok(());
    }
    let keyspace_satisfied = if job.uses_rule_splitting {
        let max_rule_end = store.max_rule_end_index(job_id).await?;
        job.total_rules.map(|total| max_rule_end >= total).unwrap_or(false)
    } else if job.effective_keyspace > 0 {
        job.dispatched_keyspace >= job.effective_keyspace
    } else {
        job.dispatched_keyspace >= job.total_keyspace
    };
    if keyspace_satisfied {
        store.update_job_status(job_id, JobStatus::Completed).await?;
        info!(job_id = %job_id, "job completed");
    }
    Ok(())
}

/// `recover_stale_jobs` (spec.md §4.7): resets tasks whose agent has gone
/// quiet or whose checkpoint is too old back to `pending`, and resets any
/// running job left with zero active tasks back to `pending`.
pub async fn recover_stale_jobs(store: &dyn Store, settings: LifecycleSettings, now: DateTime<Utc>) -> CoreResult<()> {
    let mut touched_jobs = std::collections::HashSet::new();
    for task in store.tasks_by_statuses(&[TaskStatus::Assigned, TaskStatus::Running]).await? {
        let agent_active = match task.agent_id {
            Some(agent_id) => store.get_agent(agent_id).await.map(|a| a.status == AgentStatus::Active).unwrap_or(false),
            None => false,
        };
        let checkpoint_fresh = task
            .last_checkpoint
            .map(|checkpoint| now - checkpoint < settings.stale_assignment_timeout)
            .unwrap_or(false);
        if agent_active && checkpoint_fresh {
            continue;
        }
        store.reset_task_to_pending(task.id).await?;
        touched_jobs.insert(task.job_id);
        info!(task_id = %task.id, job_id = %task.job_id, "reset stale task to pending");
    }

    for job_id in touched_jobs {
        let job = store.get_job(job_id).await?;
        if job.status == JobStatus::Running {
            let active_agents = store.count_active_agents_for_job(job_id).await?;
            if active_agents == 0 {
                store.update_job_status(job_id, JobStatus::Pending).await?;
            }
        }
    }
    Ok(())
}

/// Agents whose last heartbeat outlived the reconnect grace move their
/// non-terminal tasks to `reconnect_pending` rather than immediately
/// resetting them (spec.md §4.2); this is the session layer's disconnect
/// path, kept here since it shares the same "verify and demote" shape as
/// `cleanup_stale_agent_status`.
pub async fn demote_agent_tasks_to_reconnect_pending(store: &dyn Store, agent_id: AgentId) -> CoreResult<()> {
    let tasks = store.tasks_by_statuses(&[TaskStatus::Assigned, TaskStatus::Running]).await?;
    for task in tasks.into_iter().filter(|t| t.agent_id == Some(agent_id)) {
        store.mark_task_reconnect_pending(task.id).await?;
    }
    Ok(())
}

/// `cleanup_stale_agent_status` (spec.md §4.7): clears an agent's advisory
/// `busy_status` metadata when the task it references no longer justifies
/// it. Applying this twice is a no-op (spec.md §8 idempotence): the second
/// pass finds the metadata already cleared.
pub async fn cleanup_stale_agent_status(store: &dyn Store) -> CoreResult<()> {
    for agent in store.all_agents().await? {
        if !agent.metadata.busy {
            continue;
        }
        let still_justified = match agent.metadata.current_task_id {
            Some(task_id) => store
                .get_task(task_id)
                .await
                .map(|task| task.agent_id == Some(agent.id) && matches!(task.status, TaskStatus::Assigned | TaskStatus::Running))
                .unwrap_or(false),
            None => false,
        };
        if !still_justified {
            let mut metadata = agent.metadata;
            metadata.busy = false;
            metadata.current_task_id = None;
            metadata.current_job_id = None;
            store.update_agent_metadata(agent.id, metadata).await?;
            info!(agent_id = agent.id, "cleared stale busy status");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemStore;
    use crate::types::{Agent, AgentMetadata, Hashlist, JobExecution};
    use uuid::Uuid as RealUuid;

    fn sample_job(hashlist_id: HashlistId) -> JobExecution {
        let now = Utc::now();
        JobExecution {
            id: RealUuid::new_v4(),
            name: "job".into(),
            status: JobStatus::Running,
            priority: 0,
            max_agents: 0,
            allow_high_priority_override: false,
            hashlist_id,
            attack_mode: 3,
            hash_type: 1000,
            binary_version_id: RealUuid::new_v4(),
            wordlist_ids: vec![],
            rule_ids: vec![],
            base_keyspace: 10_000,
            multiplication_factor: 1,
            effective_keyspace: 10_000,
            total_keyspace: 10_000,
            dispatched_keyspace: 10_000,
            processed_keyspace: 10_000,
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

    #[tokio::test]
    async fn job_completion_is_idempotent() {
        let store = MemStore::new();
        let hashlist = Hashlist {
            id: RealUuid::new_v4(),
            name: "h".into(),
            hash_type: 1000,
            total_hashes: 1,
            cracked_hashes: 0,
            file_path: "h.txt".into(),
        };
        store.insert_hashlist(hashlist.clone()).await.unwrap();
        let job = sample_job(hashlist.id);
        store.insert_job(job.clone()).await.unwrap();

        check_job_completion(&store, job.id).await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Completed);

        // Running it again on an already-completed job is a no-op.
        check_job_completion(&store, job.id).await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn progress_replay_is_idempotent() {
        let store = MemStore::new();
        let hashlist = Hashlist {
            id: RealUuid::new_v4(),
            name: "h".into(),
            hash_type: 1000,
            total_hashes: 10,
            cracked_hashes: 0,
            file_path: "h.txt".into(),
        };
        store.insert_hashlist(hashlist.clone()).await.unwrap();
        let job = sample_job(hashlist.id);
        store.insert_job(job.clone()).await.unwrap();

        let now = Utc::now();
        let task = crate::planner::build_task(
            &job,
            &crate::planner::PlannedChunk { keyspace_start: 0, keyspace_end: 10_000, chunk_number: 0 },
            "hashcat ...".into(),
            1000.0,
        );
        store.insert_task(task.clone()).await.unwrap();

        record_progress(&store, task.id, 500, 50.0, None, now).await.unwrap();
        record_progress(&store, task.id, 500, 50.0, None, now).await.unwrap();
        let reloaded = store.get_task(task.id).await.unwrap();
        assert_eq!(reloaded.keyspace_processed, 500);
    }

    #[tokio::test]
    async fn stale_agent_demotes_its_tasks() {
        let store = MemStore::new();
        let hashlist = Hashlist {
            id: RealUuid::new_v4(),
            name: "h".into(),
            hash_type: 1000,
            total_hashes: 10,
            cracked_hashes: 0,
            file_path: "h.txt".into(),
        };
        store.insert_hashlist(hashlist.clone()).await.unwrap();
        let job = sample_job(hashlist.id);
        store.insert_job(job.clone()).await.unwrap();
        let now = Utc::now();
        let agent = Agent {
            id: 1,
            name: "a1".into(),
            owner: "t".into(),
            status: AgentStatus::Active,
            last_heartbeat: Some(now),
            last_seen_ip: None,
            version: "1.0".into(),
            extra_parameters: String::new(),
            metadata: AgentMetadata::default(),
            created_at: now,
            updated_at: now,
        };
        store.insert_agent(agent.clone()).await.unwrap();
        let mut task = crate::planner::build_task(
            &job,
            &crate::planner::PlannedChunk { keyspace_start: 0, keyspace_end: 10_000, chunk_number: 0 },
            "hashcat ...".into(),
            1000.0,
        );
        task.status = TaskStatus::Running;
        task.agent_id = Some(1);
        store.insert_task(task.clone()).await.unwrap();

        demote_agent_tasks_to_reconnect_pending(&store, 1).await.unwrap();
        let reloaded = store.get_task(task.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::ReconnectPending);
    }
}
