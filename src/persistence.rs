//! Persistence model (spec.md §4.1, component C1).
//!
//! Defines the `Store` trait the rest of the core depends on, a Postgres
//! implementation backed by `sqlx`, and an in-memory implementation used by
//! tests. Keeping persistence behind a trait is the direct descendant of the
//! teacher's pattern of trait-based managers (`layer8/src/gpu_manager.rs`)
//! rather than hard-wiring `sqlx::PgPool` calls throughout the scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::*;

/// Everything the scheduler, lifecycle manager, and session layer need from
/// durable storage. All mutations that touch keyspace counters or task/agent
/// assignment are documented as atomic — implementations must perform them
/// inside a single transaction with a row lock on the affected task (and, for
/// assignment, the affected agent) to uphold spec.md §3 invariants 4 and 6.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Jobs ----------------------------------------------------------
    async fn get_job(&self, id: JobId) -> CoreResult<JobExecution>;
    async fn insert_job(&self, job: JobExecution) -> CoreResult<()>;
    async fn update_job_status(&self, id: JobId, status: JobStatus) -> CoreResult<()>;
    async fn delete_job(&self, id: JobId) -> CoreResult<()>;

    /// Pending/running jobs whose `dispatched_keyspace < effective_keyspace`
    /// and whose active-agent count is below `max_agents` (0 = unlimited),
    /// ordered `(priority DESC, created_at ASC)`.
    async fn next_jobs_with_available_work(&self, max_priority: Priority) -> CoreResult<Vec<JobExecution>>;

    /// Same ordering, filtered to `allow_high_priority_override = true`.
    async fn pending_jobs_with_high_priority_override(&self) -> CoreResult<Vec<JobExecution>>;

    /// Running tasks whose owning job has priority `< below_priority` and
    /// whose job allows interruption, ordered `(priority ASC, created_at ASC)`.
    async fn interruptible_jobs(&self, below_priority: Priority) -> CoreResult<Vec<JobTask>>;

    async fn increment_dispatched_keyspace(&self, job_id: JobId, amount: u64) -> CoreResult<()>;
    async fn increment_processed_keyspace(&self, job_id: JobId, amount: u64) -> CoreResult<()>;
    async fn mark_job_accurate_keyspace(&self, job_id: JobId) -> CoreResult<()>;
    async fn set_job_total_rules(&self, job_id: JobId, total_rules: u64) -> CoreResult<()>;
    async fn set_job_rule_splitting(&self, job_id: JobId, uses_rule_splitting: bool) -> CoreResult<()>;
    async fn increment_job_rule_split_count(&self, job_id: JobId) -> CoreResult<()>;
    async fn count_active_agents_for_job(&self, job_id: JobId) -> CoreResult<u32>;
    async fn increment_job_consecutive_failures(&self, job_id: JobId) -> CoreResult<u32>;
    async fn reset_job_consecutive_failures(&self, job_id: JobId) -> CoreResult<()>;

    // -- Tasks -----------------------------------------------------------
    async fn get_task(&self, id: TaskId) -> CoreResult<JobTask>;

    /// Persist a newly planned task. Implementations must increment the
    /// owning job's `dispatched_keyspace` by the task's keyspace length (or
    /// leave it untouched for a rule-split task, whose keyspace accounting is
    /// estimated separately) inside the same transaction.
    async fn insert_task(&self, task: JobTask) -> CoreResult<()>;

    async fn tasks_by_statuses(&self, statuses: &[TaskStatus]) -> CoreResult<Vec<JobTask>>;
    async fn tasks_by_job(&self, job_id: JobId) -> CoreResult<Vec<JobTask>>;
    async fn unassigned_pending_task(&self, job_id: JobId) -> CoreResult<Option<JobTask>>;
    async fn stale_pending_task(&self, job_id: JobId, older_than: DateTime<Utc>) -> CoreResult<Option<JobTask>>;
    async fn retriable_error_task(&self, job_id: JobId, max_retry: u32) -> CoreResult<Option<JobTask>>;
    async fn max_rule_end_index(&self, job_id: JobId) -> CoreResult<u64>;
    async fn next_chunk_number(&self, job_id: JobId) -> CoreResult<u32>;
    async fn incomplete_tasks_count(&self, job_id: JobId) -> CoreResult<i64>;

    /// Bind `task_id` to `agent_id` and move it to `Assigned`, but only if the
    /// agent has no other non-terminal task (spec.md invariant 6). Returns
    /// `Ok(false)` rather than an error if the agent was already occupied —
    /// that's an ordinary race, not an invariant violation.
    async fn assign_task_to_agent(&self, task_id: TaskId, agent_id: AgentId) -> CoreResult<bool>;

    async fn reset_task_to_pending(&self, task_id: TaskId) -> CoreResult<()>;
    async fn mark_task_running(&self, task_id: TaskId) -> CoreResult<()>;
    async fn mark_task_reconnect_pending(&self, task_id: TaskId) -> CoreResult<()>;
    async fn increment_task_retry(&self, task_id: TaskId) -> CoreResult<()>;

    async fn record_task_progress(
        &self,
        task_id: TaskId,
        keyspace_processed: u64,
        progress_percent: f32,
        checkpoint: DateTime<Utc>,
    ) -> CoreResult<()>;

    async fn set_task_effective_keyspace_end(&self, task_id: TaskId, end: u64) -> CoreResult<()>;

    async fn complete_task(&self, task_id: TaskId, completed_at: DateTime<Utc>) -> CoreResult<()>;
    async fn fail_task(&self, task_id: TaskId, error_message: String) -> CoreResult<()>;
    async fn cancel_task(&self, task_id: TaskId) -> CoreResult<()>;

    // -- Agents ------------------------------------------------------------
    async fn get_agent(&self, id: AgentId) -> CoreResult<Agent>;
    async fn insert_agent(&self, agent: Agent) -> CoreResult<()>;
    async fn all_agents(&self) -> CoreResult<Vec<Agent>>;
    async fn agents_idle(&self) -> CoreResult<Vec<Agent>>;
    async fn update_agent_status(&self, id: AgentId, status: AgentStatus) -> CoreResult<()>;
    async fn update_agent_heartbeat(&self, id: AgentId, ip: Option<String>) -> CoreResult<()>;
    async fn update_agent_metadata(&self, id: AgentId, metadata: AgentMetadata) -> CoreResult<()>;
    async fn increment_agent_consecutive_failures(&self, id: AgentId) -> CoreResult<u32>;
    async fn reset_agent_consecutive_failures(&self, id: AgentId) -> CoreResult<()>;

    async fn list_devices(&self, agent_id: AgentId) -> CoreResult<Vec<Device>>;
    async fn upsert_devices(&self, agent_id: AgentId, devices: Vec<Device>) -> CoreResult<()>;
    async fn set_device_enabled(&self, device_id: i32, enabled: bool) -> CoreResult<()>;

    // -- Hashlists & cracks --------------------------------------------
    async fn get_hashlist(&self, id: HashlistId) -> CoreResult<Hashlist>;
    async fn insert_hashlist(&self, hashlist: Hashlist) -> CoreResult<()>;
    async fn increment_cracked(&self, hashlist_id: HashlistId, amount: i64) -> CoreResult<Hashlist>;
    async fn insert_crack(&self, crack: Crack) -> CoreResult<()>;
    /// Pending jobs whose target hashlist is the given one (used by the
    /// hashlist-completion handler, spec.md §4.7 step 2).
    async fn pending_jobs_for_hashlist(&self, hashlist_id: HashlistId) -> CoreResult<Vec<JobExecution>>;
    /// Running tasks whose job targets the given hashlist (spec.md §4.7 step 1).
    async fn running_tasks_for_hashlist(&self, hashlist_id: HashlistId) -> CoreResult<Vec<JobTask>>;

    // -- Benchmarks -----------------------------------------------------
    async fn get_benchmark(&self, key: BenchmarkKey) -> CoreResult<Option<BenchmarkEntry>>;
    async fn upsert_benchmark(&self, entry: BenchmarkEntry) -> CoreResult<()>;
}

// ===========================================================================
// Postgres implementation
// ===========================================================================

/// `Store` backed by Postgres via `sqlx`. Queries are issued with the runtime
/// query builder rather than the `sqlx::query!` compile-time macros, since the
/// core is built without a live database to check against at compile time.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_job(&self, id: JobId) -> CoreResult<JobExecution> {
        sqlx::query_as::<_, JobExecutionRow>("SELECT * FROM job_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or(CoreError::JobNotFound(id))
    }

    async fn insert_job(&self, job: JobExecution) -> CoreResult<()> {
        let row: JobExecutionRow = job.into();
        sqlx::query(
            "INSERT INTO job_executions (
                id, name, status, priority, max_agents, allow_high_priority_override,
                hashlist_id, attack_mode, hash_type, binary_version_id, wordlist_ids, rule_ids,
                base_keyspace, multiplication_factor, effective_keyspace, total_keyspace,
                dispatched_keyspace, processed_keyspace, is_accurate_keyspace,
                uses_rule_splitting, rule_split_count, total_rules,
                chunk_size_seconds, consecutive_failures, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25,$26)",
        )
        .bind(row.id)
        .bind(row.name)
        .bind(row.status)
        .bind(row.priority)
        .bind(row.max_agents)
        .bind(row.allow_high_priority_override)
        .bind(row.hashlist_id)
        .bind(row.attack_mode)
        .bind(row.hash_type)
        .bind(row.binary_version_id)
        .bind(row.wordlist_ids)
        .bind(row.rule_ids)
        .bind(row.base_keyspace)
        .bind(row.multiplication_factor)
        .bind(row.effective_keyspace)
        .bind(row.total_keyspace)
        .bind(row.dispatched_keyspace)
        .bind(row.processed_keyspace)
        .bind(row.is_accurate_keyspace)
        .bind(row.uses_rule_splitting)
        .bind(row.rule_split_count)
        .bind(row.total_rules)
        .bind(row.chunk_size_seconds)
        .bind(row.consecutive_failures)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job_status(&self, id: JobId, status: JobStatus) -> CoreResult<()> {
        sqlx::query("UPDATE job_executions SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_tasks WHERE job_id = $1 AND status NOT IN ('completed','failed','cancelled')")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_executions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn next_jobs_with_available_work(&self, max_priority: Priority) -> CoreResult<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, JobExecutionRow>(
            "SELECT j.* FROM job_executions j
             WHERE j.status IN ('pending','running')
               AND j.priority <= $1
               AND j.dispatched_keyspace < j.effective_keyspace
               AND (j.max_agents = 0 OR (
                     SELECT count(DISTINCT t.agent_id) FROM job_tasks t
                     WHERE t.job_id = j.id AND t.status IN ('assigned','running')
                   ) < j.max_agents)
             ORDER BY j.priority DESC, j.created_at ASC",
        )
        .bind(max_priority)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn pending_jobs_with_high_priority_override(&self) -> CoreResult<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, JobExecutionRow>(
            "SELECT * FROM job_executions
             WHERE status = 'pending' AND allow_high_priority_override = true
             ORDER BY priority DESC, created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn interruptible_jobs(&self, below_priority: Priority) -> CoreResult<Vec<JobTask>> {
        let rows = sqlx::query_as::<_, JobTaskRow>(
            "SELECT t.* FROM job_tasks t
             JOIN job_executions j ON j.id = t.job_id
             WHERE t.status = 'running'
               AND j.priority < $1
               AND j.allow_high_priority_override = true
             ORDER BY j.priority ASC, j.created_at ASC",
        )
        .bind(below_priority)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn increment_dispatched_keyspace(&self, job_id: JobId, amount: u64) -> CoreResult<()> {
        sqlx::query("UPDATE job_executions SET dispatched_keyspace = dispatched_keyspace + $2, updated_at = now() WHERE id = $1")
            .bind(job_id)
            .bind(amount as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_processed_keyspace(&self, job_id: JobId, amount: u64) -> CoreResult<()> {
        sqlx::query("UPDATE job_executions SET processed_keyspace = processed_keyspace + $2, updated_at = now() WHERE id = $1")
            .bind(job_id)
            .bind(amount as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_job_accurate_keyspace(&self, job_id: JobId) -> CoreResult<()> {
        sqlx::query("UPDATE job_executions SET is_accurate_keyspace = true WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_job_total_rules(&self, job_id: JobId, total_rules: u64) -> CoreResult<()> {
        sqlx::query("UPDATE job_executions SET total_rules = $2 WHERE id = $1")
            .bind(job_id)
            .bind(total_rules as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_job_rule_splitting(&self, job_id: JobId, uses_rule_splitting: bool) -> CoreResult<()> {
        sqlx::query("UPDATE job_executions SET uses_rule_splitting = $2 WHERE id = $1")
            .bind(job_id)
            .bind(uses_rule_splitting)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_job_rule_split_count(&self, job_id: JobId) -> CoreResult<()> {
        sqlx::query("UPDATE job_executions SET rule_split_count = rule_split_count + 1 WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_active_agents_for_job(&self, job_id: JobId) -> CoreResult<u32> {
        let count: (i64,) = sqlx::query_as(
            "SELECT count(DISTINCT agent_id) FROM job_tasks WHERE job_id = $1 AND status IN ('assigned','running')",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as u32)
    }

    async fn increment_job_consecutive_failures(&self, job_id: JobId) -> CoreResult<u32> {
        let row: (i32,) = sqlx::query_as(
            "UPDATE job_executions SET consecutive_failures = consecutive_failures + 1
             WHERE id = $1 RETURNING consecutive_failures",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u32)
    }

    async fn reset_job_consecutive_failures(&self, job_id: JobId) -> CoreResult<()> {
        sqlx::query("UPDATE job_executions SET consecutive_failures = 0 WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> CoreResult<JobTask> {
        sqlx::query_as::<_, JobTaskRow>("SELECT * FROM job_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or(CoreError::TaskNotFound(id))
    }

    async fn insert_task(&self, task: JobTask) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let keyspace_len = task.keyspace_len();
        let row: JobTaskRow = task.into();
        sqlx::query(
            "INSERT INTO job_tasks (
                id, job_id, agent_id, status, priority, attack_cmd,
                keyspace_start, keyspace_end, keyspace_processed,
                effective_keyspace_start, effective_keyspace_end,
                rule_start_index, rule_end_index, rule_chunk_path, is_rule_split_task,
                chunk_number, chunk_duration, benchmark_speed, last_checkpoint,
                retry_count, assigned_at, completed_at, error_message, progress_percent,
                created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20,$21,$22,$23,$24,$25,$26)",
        )
        .bind(row.id)
        .bind(row.job_id)
        .bind(row.agent_id)
        .bind(row.status)
        .bind(row.priority)
        .bind(row.attack_cmd)
        .bind(row.keyspace_start)
        .bind(row.keyspace_end)
        .bind(row.keyspace_processed)
        .bind(row.effective_keyspace_start)
        .bind(row.effective_keyspace_end)
        .bind(row.rule_start_index)
        .bind(row.rule_end_index)
        .bind(row.rule_chunk_path)
        .bind(row.is_rule_split_task)
        .bind(row.chunk_number)
        .bind(row.chunk_duration)
        .bind(row.benchmark_speed)
        .bind(row.last_checkpoint)
        .bind(row.retry_count)
        .bind(row.assigned_at)
        .bind(row.completed_at)
        .bind(row.error_message)
        .bind(row.progress_percent)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&mut *tx)
        .await?;

        if !row.is_rule_split_task {
            sqlx::query(
                "UPDATE job_executions SET dispatched_keyspace = dispatched_keyspace + $2, updated_at = now() WHERE id = $1",
            )
            .bind(row.job_id)
            .bind(keyspace_len as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn tasks_by_statuses(&self, statuses: &[TaskStatus]) -> CoreResult<Vec<JobTask>> {
        let names: Vec<String> = statuses.iter().map(status_name).collect();
        let rows = sqlx::query_as::<_, JobTaskRow>("SELECT * FROM job_tasks WHERE status = ANY($1)")
            .bind(&names)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn tasks_by_job(&self, job_id: JobId) -> CoreResult<Vec<JobTask>> {
        let rows = sqlx::query_as::<_, JobTaskRow>("SELECT * FROM job_tasks WHERE job_id = $1 ORDER BY chunk_number ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn unassigned_pending_task(&self, job_id: JobId) -> CoreResult<Option<JobTask>> {
        let row = sqlx::query_as::<_, JobTaskRow>(
            "SELECT * FROM job_tasks WHERE job_id = $1 AND status = 'pending' AND agent_id IS NULL
             ORDER BY chunk_number ASC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn stale_pending_task(&self, job_id: JobId, older_than: DateTime<Utc>) -> CoreResult<Option<JobTask>> {
        let row = sqlx::query_as::<_, JobTaskRow>(
            "SELECT * FROM job_tasks WHERE job_id = $1 AND status = 'pending' AND updated_at < $2
             ORDER BY chunk_number ASC LIMIT 1",
        )
        .bind(job_id)
        .bind(older_than)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn retriable_error_task(&self, job_id: JobId, max_retry: u32) -> CoreResult<Option<JobTask>> {
        let row = sqlx::query_as::<_, JobTaskRow>(
            "SELECT * FROM job_tasks WHERE job_id = $1 AND status = 'failed' AND retry_count < $2
             ORDER BY chunk_number ASC LIMIT 1",
        )
        .bind(job_id)
        .bind(max_retry as i32)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn max_rule_end_index(&self, job_id: JobId) -> CoreResult<u64> {
        let row: (Option<i64>,) = sqlx::query_as(
            "SELECT max(rule_end_index) FROM job_tasks WHERE job_id = $1 AND status != 'cancelled'",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.unwrap_or(0) as u64)
    }

    async fn next_chunk_number(&self, job_id: JobId) -> CoreResult<u32> {
        let row: (Option<i32>,) = sqlx::query_as("SELECT max(chunk_number) FROM job_tasks WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.map(|n| n as u32 + 1).unwrap_or(0))
    }

    async fn incomplete_tasks_count(&self, job_id: JobId) -> CoreResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM job_tasks WHERE job_id = $1 AND status NOT IN ('completed','failed','cancelled')",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn assign_task_to_agent(&self, task_id: TaskId, agent_id: AgentId) -> CoreResult<bool> {
        let mut tx = self.pool.begin().await?;
        let busy: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM job_tasks WHERE agent_id = $1 AND status IN ('assigned','running')",
        )
        .bind(agent_id)
        .fetch_one(&mut *tx)
        .await?;
        if busy.0 > 0 {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE job_tasks SET agent_id = $2, status = 'assigned', assigned_at = now(), updated_at = now()
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(task_id)
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_task_to_pending(&self, task_id: TaskId) -> CoreResult<()> {
        sqlx::query(
            "UPDATE job_tasks SET agent_id = NULL, status = 'pending', assigned_at = NULL, updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_task_running(&self, task_id: TaskId) -> CoreResult<()> {
        sqlx::query("UPDATE job_tasks SET status = 'running', updated_at = now() WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_task_reconnect_pending(&self, task_id: TaskId) -> CoreResult<()> {
        sqlx::query("UPDATE job_tasks SET status = 'reconnect_pending', updated_at = now() WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_task_retry(&self, task_id: TaskId) -> CoreResult<()> {
        sqlx::query("UPDATE job_tasks SET retry_count = retry_count + 1, updated_at = now() WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_task_progress(
        &self,
        task_id: TaskId,
        keyspace_processed: u64,
        progress_percent: f32,
        checkpoint: DateTime<Utc>,
    ) -> CoreResult<()> {
        sqlx::query(
            "UPDATE job_tasks SET keyspace_processed = $2, progress_percent = $3, last_checkpoint = $4, updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(keyspace_processed as i64)
        .bind(progress_percent)
        .bind(checkpoint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_task_effective_keyspace_end(&self, task_id: TaskId, end: u64) -> CoreResult<()> {
        sqlx::query("UPDATE job_tasks SET effective_keyspace_end = $2 WHERE id = $1")
            .bind(task_id)
            .bind(end as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_task(&self, task_id: TaskId, completed_at: DateTime<Utc>) -> CoreResult<()> {
        sqlx::query(
            "UPDATE job_tasks SET status = 'completed', completed_at = $2, progress_percent = 100.0, updated_at = now()
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_task(&self, task_id: TaskId, error_message: String) -> CoreResult<()> {
        sqlx::query("UPDATE job_tasks SET status = 'failed', error_message = $2, updated_at = now() WHERE id = $1")
            .bind(task_id)
            .bind(error_message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn cancel_task(&self, task_id: TaskId) -> CoreResult<()> {
        sqlx::query("UPDATE job_tasks SET status = 'cancelled', updated_at = now() WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> CoreResult<Agent> {
        sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(TryInto::try_into)
            .transpose()?
            .ok_or(CoreError::AgentNotFound(id))
    }

    async fn insert_agent(&self, agent: Agent) -> CoreResult<()> {
        let row: AgentRow = agent.try_into()?;
        sqlx::query(
            "INSERT INTO agents (id, name, owner, status, last_heartbeat, last_seen_ip, version, extra_parameters, metadata, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)",
        )
        .bind(row.id)
        .bind(row.name)
        .bind(row.owner)
        .bind(row.status)
        .bind(row.last_heartbeat)
        .bind(row.last_seen_ip)
        .bind(row.version)
        .bind(row.extra_parameters)
        .bind(row.metadata)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all_agents(&self) -> CoreResult<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents").fetch_all(&self.pool).await?;
        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn agents_idle(&self) -> CoreResult<Vec<Agent>> {
        let rows = sqlx::query_as::<_, AgentRow>(
            "SELECT a.* FROM agents a
             WHERE a.status = 'active'
               AND NOT EXISTS (
                 SELECT 1 FROM job_tasks t WHERE t.agent_id = a.id AND t.status IN ('assigned','running')
               )",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TryInto::try_into).collect::<Result<_, _>>().map_err(Into::into)
    }

    async fn update_agent_status(&self, id: AgentId, status: AgentStatus) -> CoreResult<()> {
        sqlx::query("UPDATE agents SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_agent_heartbeat(&self, id: AgentId, ip: Option<String>) -> CoreResult<()> {
        sqlx::query("UPDATE agents SET last_heartbeat = now(), last_seen_ip = coalesce($2, last_seen_ip), updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_agent_metadata(&self, id: AgentId, metadata: AgentMetadata) -> CoreResult<()> {
        let json = serde_json::to_value(&metadata)?;
        sqlx::query("UPDATE agents SET metadata = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_agent_consecutive_failures(&self, id: AgentId) -> CoreResult<u32> {
        let mut agent = self.get_agent(id).await?;
        agent.metadata.consecutive_failures += 1;
        let n = agent.metadata.consecutive_failures;
        self.update_agent_metadata(id, agent.metadata).await?;
        Ok(n)
    }

    async fn reset_agent_consecutive_failures(&self, id: AgentId) -> CoreResult<()> {
        let mut agent = self.get_agent(id).await?;
        agent.metadata.consecutive_failures = 0;
        self.update_agent_metadata(id, agent.metadata).await
    }

    async fn list_devices(&self, agent_id: AgentId) -> CoreResult<Vec<Device>> {
        let rows = sqlx::query_as::<_, DeviceRow>("SELECT * FROM devices WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn upsert_devices(&self, agent_id: AgentId, devices: Vec<Device>) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for device in devices {
            let row: DeviceRow = device.into();
            sqlx::query(
                "INSERT INTO devices (id, agent_id, kind, name, memory_mb, backend, is_alias, enabled)
                 VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                 ON CONFLICT (id, agent_id) DO UPDATE SET
                   name = excluded.name, memory_mb = excluded.memory_mb,
                   backend = excluded.backend, is_alias = excluded.is_alias",
            )
            .bind(row.id)
            .bind(agent_id)
            .bind(row.kind)
            .bind(row.name)
            .bind(row.memory_mb)
            .bind(row.backend)
            .bind(row.is_alias)
            .bind(row.enabled)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_device_enabled(&self, device_id: i32, enabled: bool) -> CoreResult<()> {
        sqlx::query("UPDATE devices SET enabled = $2 WHERE id = $1")
            .bind(device_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_hashlist(&self, id: HashlistId) -> CoreResult<Hashlist> {
        sqlx::query_as::<_, HashlistRow>("SELECT * FROM hashlists WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Into::into)
            .ok_or(CoreError::HashlistNotFound(id))
    }

    async fn insert_hashlist(&self, hashlist: Hashlist) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO hashlists (id, name, hash_type, total_hashes, cracked_hashes, file_path)
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(hashlist.id)
        .bind(hashlist.name)
        .bind(hashlist.hash_type)
        .bind(hashlist.total_hashes)
        .bind(hashlist.cracked_hashes)
        .bind(hashlist.file_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_cracked(&self, hashlist_id: HashlistId, amount: i64) -> CoreResult<Hashlist> {
        let row = sqlx::query_as::<_, HashlistRow>(
            "UPDATE hashlists SET cracked_hashes = LEAST(cracked_hashes + $2, total_hashes)
             WHERE id = $1 RETURNING *",
        )
        .bind(hashlist_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn insert_crack(&self, crack: Crack) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO cracks (hash_id, hashlist_id, plaintext, task_id, cracked_at) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(crack.hash_id)
        .bind(crack.hashlist_id)
        .bind(crack.plaintext)
        .bind(crack.task_id)
        .bind(crack.cracked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pending_jobs_for_hashlist(&self, hashlist_id: HashlistId) -> CoreResult<Vec<JobExecution>> {
        let rows = sqlx::query_as::<_, JobExecutionRow>(
            "SELECT * FROM job_executions WHERE hashlist_id = $1 AND status IN ('pending','paused')",
        )
        .bind(hashlist_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn running_tasks_for_hashlist(&self, hashlist_id: HashlistId) -> CoreResult<Vec<JobTask>> {
        let rows = sqlx::query_as::<_, JobTaskRow>(
            "SELECT t.* FROM job_tasks t
             JOIN job_executions j ON j.id = t.job_id
             WHERE j.hashlist_id = $1 AND t.status IN ('assigned','running')",
        )
        .bind(hashlist_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn get_benchmark(&self, key: BenchmarkKey) -> CoreResult<Option<BenchmarkEntry>> {
        let row = sqlx::query_as::<_, BenchmarkRow>(
            "SELECT * FROM benchmarks WHERE agent_id = $1 AND attack_mode = $2 AND hash_type = $3",
        )
        .bind(key.0)
        .bind(key.1)
        .bind(key.2)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn upsert_benchmark(&self, entry: BenchmarkEntry) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO benchmarks (agent_id, attack_mode, hash_type, speed, updated_at)
             VALUES ($1,$2,$3,$4,$5)
             ON CONFLICT (agent_id, attack_mode, hash_type)
             DO UPDATE SET speed = excluded.speed, updated_at = excluded.updated_at",
        )
        .bind(entry.agent_id)
        .bind(entry.attack_mode)
        .bind(entry.hash_type)
        .bind(entry.speed)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn status_name(s: &TaskStatus) -> String {
    match s {
        TaskStatus::Pending => "pending",
        TaskStatus::Assigned => "assigned",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::ReconnectPending => "reconnect_pending",
    }
    .to_string()
}

// -- sqlx row shims ----------------------------------------------------
// The entity types in `types.rs` carry richer Rust types (Vec<Uuid>, typed
// enums over JSON columns) than map 1:1 onto `FromRow`; these thin row
// structs are the sqlx-facing shape and convert into/from the public types.

#[derive(sqlx::FromRow)]
struct JobExecutionRow {
    id: Uuid,
    name: String,
    status: JobStatus,
    priority: i32,
    max_agents: i32,
    allow_high_priority_override: bool,
    hashlist_id: Uuid,
    attack_mode: i32,
    hash_type: i32,
    binary_version_id: Uuid,
    wordlist_ids: Vec<Uuid>,
    rule_ids: Vec<Uuid>,
    base_keyspace: i64,
    multiplication_factor: i64,
    effective_keyspace: i64,
    total_keyspace: i64,
    dispatched_keyspace: i64,
    processed_keyspace: i64,
    is_accurate_keyspace: bool,
    uses_rule_splitting: bool,
    rule_split_count: i32,
    total_rules: Option<i64>,
    chunk_size_seconds: i32,
    consecutive_failures: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobExecution> for JobExecutionRow {
    fn from(j: JobExecution) -> Self {
        Self {
            id: j.id,
            name: j.name,
            status: j.status,
            priority: j.priority,
            max_agents: j.max_agents as i32,
            allow_high_priority_override: j.allow_high_priority_override,
            hashlist_id: j.hashlist_id,
            attack_mode: j.attack_mode,
            hash_type: j.hash_type,
            binary_version_id: j.binary_version_id,
            wordlist_ids: j.wordlist_ids,
            rule_ids: j.rule_ids,
            base_keyspace: j.base_keyspace as i64,
            multiplication_factor: j.multiplication_factor as i64,
            effective_keyspace: j.effective_keyspace as i64,
            total_keyspace: j.total_keyspace as i64,
            dispatched_keyspace: j.dispatched_keyspace as i64,
            processed_keyspace: j.processed_keyspace as i64,
            is_accurate_keyspace: j.is_accurate_keyspace,
            uses_rule_splitting: j.uses_rule_splitting,
            rule_split_count: j.rule_split_count as i32,
            total_rules: j.total_rules.map(|n| n as i64),
            chunk_size_seconds: j.chunk_size_seconds as i32,
            consecutive_failures: j.consecutive_failures as i32,
            created_at: j.created_at,
            updated_at: j.updated_at,
        }
    }
}

impl From<JobExecutionRow> for JobExecution {
    fn from(r: JobExecutionRow) -> Self {
        Self {
            id: r.id,
            name: r.name,
            status: r.status,
            priority: r.priority,
            max_agents: r.max_agents as u32,
            allow_high_priority_override: r.allow_high_priority_override,
            hashlist_id: r.hashlist_id,
            attack_mode: r.attack_mode,
            hash_type: r.hash_type,
            binary_version_id: r.binary_version_id,
            wordlist_ids: r.wordlist_ids,
            rule_ids: r.rule_ids,
            base_keyspace: r.base_keyspace as u64,
            multiplication_factor: r.multiplication_factor as u64,
            effective_keyspace: r.effective_keyspace as u64,
            total_keyspace: r.total_keyspace as u64,
            dispatched_keyspace: r.dispatched_keyspace as u64,
            processed_keyspace: r.processed_keyspace as u64,
            is_accurate_keyspace: r.is_accurate_keyspace,
            uses_rule_splitting: r.uses_rule_splitting,
            rule_split_count: r.rule_split_count as u32,
            total_rules: r.total_rules.map(|n| n as u64),
            chunk_size_seconds: r.chunk_size_seconds as u32,
            consecutive_failures: r.consecutive_failures as u32,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobTaskRow {
    id: Uuid,
    job_id: Uuid,
    agent_id: Option<AgentId>,
    status: TaskStatus,
    priority: i32,
    attack_cmd: String,
    keyspace_start: i64,
    keyspace_end: i64,
    keyspace_processed: i64,
    effective_keyspace_start: Option<i64>,
    effective_keyspace_end: Option<i64>,
    rule_start_index: Option<i64>,
    rule_end_index: Option<i64>,
    rule_chunk_path: Option<String>,
    is_rule_split_task: bool,
    chunk_number: i32,
    chunk_duration: i32,
    benchmark_speed: Option<f64>,
    last_checkpoint: Option<DateTime<Utc>>,
    retry_count: i32,
    assigned_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    progress_percent: f32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobTask> for JobTaskRow {
    fn from(t: JobTask) -> Self {
        Self {
            id: t.id,
            job_id: t.job_id,
            agent_id: t.agent_id,
            status: t.status,
            priority: t.priority,
            attack_cmd: t.attack_cmd,
            keyspace_start: t.keyspace_start as i64,
            keyspace_end: t.keyspace_end as i64,
            keyspace_processed: t.keyspace_processed as i64,
            effective_keyspace_start: t.effective_keyspace_start.map(|n| n as i64),
            effective_keyspace_end: t.effective_keyspace_end.map(|n| n as i64),
            rule_start_index: t.rule_start_index.map(|n| n as i64),
            rule_end_index: t.rule_end_index.map(|n| n as i64),
            rule_chunk_path: t.rule_chunk_path,
            is_rule_split_task: t.is_rule_split_task,
            chunk_number: t.chunk_number as i32,
            chunk_duration: t.chunk_duration as i32,
            benchmark_speed: t.benchmark_speed,
            last_checkpoint: t.last_checkpoint,
            retry_count: t.retry_count as i32,
            assigned_at: t.assigned_at,
            completed_at: t.completed_at,
            error_message: t.error_message,
            progress_percent: t.progress_percent,
            created_at: t.created_at,
            updated_at: t.updated_at,
        }
    }
}

impl From<JobTaskRow> for JobTask {
    fn from(r: JobTaskRow) -> Self {
        Self {
            id: r.id,
            job_id: r.job_id,
            agent_id: r.agent_id,
            status: r.status,
            priority: r.priority,
            attack_cmd: r.attack_cmd,
            keyspace_start: r.keyspace_start as u64,
            keyspace_end: r.keyspace_end as u64,
            keyspace_processed: r.keyspace_processed as u64,
            effective_keyspace_start: r.effective_keyspace_start.map(|n| n as u64),
            effective_keyspace_end: r.effective_keyspace_end.map(|n| n as u64),
            rule_start_index: r.rule_start_index.map(|n| n as u64),
            rule_end_index: r.rule_end_index.map(|n| n as u64),
            rule_chunk_path: r.rule_chunk_path,
            is_rule_split_task: r.is_rule_split_task,
            chunk_number: r.chunk_number as u32,
            chunk_duration: r.chunk_duration as u32,
            benchmark_speed: r.benchmark_speed,
            last_checkpoint: r.last_checkpoint,
            retry_count: r.retry_count as u32,
            assigned_at: r.assigned_at,
            completed_at: r.completed_at,
            error_message: r.error_message,
            progress_percent: r.progress_percent,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AgentRow {
    id: AgentId,
    name: String,
    owner: String,
    status: AgentStatus,
    last_heartbeat: Option<DateTime<Utc>>,
    last_seen_ip: Option<String>,
    version: String,
    extra_parameters: String,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<Agent> for AgentRow {
    type Error = CoreError;
    fn try_from(a: Agent) -> CoreResult<Self> {
        Ok(Self {
            id: a.id,
            name: a.name,
            owner: a.owner,
            status: a.status,
            last_heartbeat: a.last_heartbeat,
            last_seen_ip: a.last_seen_ip,
            version: a.version,
            extra_parameters: a.extra_parameters,
            metadata: serde_json::to_value(&a.metadata)?,
            created_at: a.created_at,
            updated_at: a.updated_at,
        })
    }
}

impl TryFrom<AgentRow> for Agent {
    type Error = CoreError;
    fn try_from(r: AgentRow) -> CoreResult<Self> {
        Ok(Self {
            id: r.id,
            name: r.name,
            owner: r.owner,
            status: r.status,
            last_heartbeat: r.last_heartbeat,
            last_seen_ip: r.last_seen_ip,
            version: r.version,
            extra_parameters: r.extra_parameters,
            metadata: serde_json::from_value(r.metadata)?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeviceRow {
    id: i32,
    agent_id: AgentId,
    kind: DeviceKind,
    name: String,
    memory_mb: i64,
    backend: String,
    is_alias: bool,
    enabled: bool,
}

impl From<Device> for DeviceRow {
    fn from(d: Device) -> Self {
        Self {
            id: d.id,
            agent_id: d.agent_id,
            kind: d.kind,
            name: d.name,
            memory_mb: d.memory_mb as i64,
            backend: d.backend,
            is_alias: d.is_alias,
            enabled: d.enabled,
        }
    }
}

impl From<DeviceRow> for Device {
    fn from(r: DeviceRow) -> Self {
        Self {
            id: r.id,
            agent_id: r.agent_id,
            kind: r.kind,
            name: r.name,
            memory_mb: r.memory_mb as u64,
            backend: r.backend,
            is_alias: r.is_alias,
            enabled: r.enabled,
        }
    }
}

#[derive(sqlx::FromRow)]
struct HashlistRow {
    id: Uuid,
    name: String,
    hash_type: i32,
    total_hashes: i64,
    cracked_hashes: i64,
    file_path: String,
}

impl From<HashlistRow> for Hashlist {
    fn from(r: HashlistRow) -> Self {
        Self {
            id: r.id,
            name: r.name,
            hash_type: r.hash_type,
            total_hashes: r.total_hashes,
            cracked_hashes: r.cracked_hashes,
            file_path: r.file_path,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BenchmarkRow {
    agent_id: AgentId,
    attack_mode: i32,
    hash_type: i32,
    speed: f64,
    updated_at: DateTime<Utc>,
}

impl From<BenchmarkRow> for BenchmarkEntry {
    fn from(r: BenchmarkRow) -> Self {
        Self {
            agent_id: r.agent_id,
            attack_mode: r.attack_mode,
            hash_type: r.hash_type,
            speed: r.speed,
            updated_at: r.updated_at,
        }
    }
}

// ===========================================================================
// In-memory implementation (tests)
// ===========================================================================

/// In-memory `Store` used by unit and integration tests. Implements the same
/// ordering and atomicity contracts as `PgStore`, guarded by a single
/// `RwLock` per table rather than database row locks.
#[derive(Default)]
pub struct MemStore {
    inner: RwLock<MemTables>,
}

#[derive(Default)]
struct MemTables {
    jobs: HashMap<JobId, JobExecution>,
    tasks: HashMap<TaskId, JobTask>,
    agents: HashMap<AgentId, Agent>,
    devices: HashMap<AgentId, Vec<Device>>,
    hashlists: HashMap<HashlistId, Hashlist>,
    cracks: Vec<Crack>,
    benchmarks: HashMap<BenchmarkKey, BenchmarkEntry>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_job(&self, id: JobId) -> CoreResult<JobExecution> {
        self.inner.read().await.jobs.get(&id).cloned().ok_or(CoreError::JobNotFound(id))
    }

    async fn insert_job(&self, job: JobExecution) -> CoreResult<()> {
        self.inner.write().await.jobs.insert(job.id, job);
        Ok(())
    }

    async fn update_job_status(&self, id: JobId, status: JobStatus) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&id).ok_or(CoreError::JobNotFound(id))?;
        job.status = status;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_job(&self, id: JobId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        g.jobs.remove(&id);
        g.tasks.retain(|_, t| t.job_id != id || t.status.is_terminal());
        Ok(())
    }

    async fn next_jobs_with_available_work(&self, max_priority: Priority) -> CoreResult<Vec<JobExecution>> {
        let g = self.inner.read().await;
        let mut jobs: Vec<JobExecution> = g
            .jobs
            .values()
            .filter(|j| {
                matches!(j.status, JobStatus::Pending | JobStatus::Running)
                    && j.priority <= max_priority
                    && j.dispatched_keyspace < j.effective_keyspace
                    && (j.max_agents == 0 || active_agents_for_job(&g, j.id) < j.max_agents)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(jobs)
    }

    async fn pending_jobs_with_high_priority_override(&self) -> CoreResult<Vec<JobExecution>> {
        let g = self.inner.read().await;
        let mut jobs: Vec<JobExecution> = g
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.allow_high_priority_override)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        Ok(jobs)
    }

    async fn interruptible_jobs(&self, below_priority: Priority) -> CoreResult<Vec<JobTask>> {
        let g = self.inner.read().await;
        let mut tasks: Vec<JobTask> = g
            .tasks
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && g.jobs
                        .get(&t.job_id)
                        .map(|j| j.priority < below_priority && j.allow_high_priority_override)
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            let pa = g.jobs.get(&a.job_id).map(|j| j.priority).unwrap_or(0);
            let pb = g.jobs.get(&b.job_id).map(|j| j.priority).unwrap_or(0);
            pa.cmp(&pb).then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn increment_dispatched_keyspace(&self, job_id: JobId, amount: u64) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        job.dispatched_keyspace += amount;
        Ok(())
    }

    async fn increment_processed_keyspace(&self, job_id: JobId, amount: u64) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        job.processed_keyspace += amount;
        Ok(())
    }

    async fn mark_job_accurate_keyspace(&self, job_id: JobId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        job.is_accurate_keyspace = true;
        Ok(())
    }

    async fn set_job_total_rules(&self, job_id: JobId, total_rules: u64) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        job.total_rules = Some(total_rules);
        Ok(())
    }

    async fn set_job_rule_splitting(&self, job_id: JobId, uses_rule_splitting: bool) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        job.uses_rule_splitting = uses_rule_splitting;
        Ok(())
    }

    async fn increment_job_rule_split_count(&self, job_id: JobId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        job.rule_split_count += 1;
        Ok(())
    }

    async fn count_active_agents_for_job(&self, job_id: JobId) -> CoreResult<u32> {
        let g = self.inner.read().await;
        Ok(active_agents_for_job(&g, job_id))
    }

    async fn increment_job_consecutive_failures(&self, job_id: JobId) -> CoreResult<u32> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        job.consecutive_failures += 1;
        Ok(job.consecutive_failures)
    }

    async fn reset_job_consecutive_failures(&self, job_id: JobId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let job = g.jobs.get_mut(&job_id).ok_or(CoreError::JobNotFound(job_id))?;
        job.consecutive_failures = 0;
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> CoreResult<JobTask> {
        self.inner.read().await.tasks.get(&id).cloned().ok_or(CoreError::TaskNotFound(id))
    }

    async fn insert_task(&self, task: JobTask) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        if !task.is_rule_split_task {
            let len = task.keyspace_len();
            if let Some(job) = g.jobs.get_mut(&task.job_id) {
                job.dispatched_keyspace += len;
            }
        }
        g.tasks.insert(task.id, task);
        Ok(())
    }

    async fn tasks_by_statuses(&self, statuses: &[TaskStatus]) -> CoreResult<Vec<JobTask>> {
        let g = self.inner.read().await;
        Ok(g.tasks.values().filter(|t| statuses.contains(&t.status)).cloned().collect())
    }

    async fn tasks_by_job(&self, job_id: JobId) -> CoreResult<Vec<JobTask>> {
        let g = self.inner.read().await;
        let mut tasks: Vec<JobTask> = g.tasks.values().filter(|t| t.job_id == job_id).cloned().collect();
        tasks.sort_by_key(|t| t.chunk_number);
        Ok(tasks)
    }

    async fn unassigned_pending_task(&self, job_id: JobId) -> CoreResult<Option<JobTask>> {
        let g = self.inner.read().await;
        let mut tasks: Vec<&JobTask> = g
            .tasks
            .values()
            .filter(|t| t.job_id == job_id && t.status == TaskStatus::Pending && t.agent_id.is_none())
            .collect();
        tasks.sort_by_key(|t| t.chunk_number);
        Ok(tasks.first().map(|t| (*t).clone()))
    }

    async fn stale_pending_task(&self, job_id: JobId, older_than: DateTime<Utc>) -> CoreResult<Option<JobTask>> {
        let g = self.inner.read().await;
        let mut tasks: Vec<&JobTask> = g
            .tasks
            .values()
            .filter(|t| t.job_id == job_id && t.status == TaskStatus::Pending && t.updated_at < older_than)
            .collect();
        tasks.sort_by_key(|t| t.chunk_number);
        Ok(tasks.first().map(|t| (*t).clone()))
    }

    async fn retriable_error_task(&self, job_id: JobId, max_retry: u32) -> CoreResult<Option<JobTask>> {
        let g = self.inner.read().await;
        let mut tasks: Vec<&JobTask> = g
            .tasks
            .values()
            .filter(|t| t.job_id == job_id && t.status == TaskStatus::Failed && t.retry_count < max_retry)
            .collect();
        tasks.sort_by_key(|t| t.chunk_number);
        Ok(tasks.first().map(|t| (*t).clone()))
    }

    async fn max_rule_end_index(&self, job_id: JobId) -> CoreResult<u64> {
        let g = self.inner.read().await;
        Ok(g.tasks
            .values()
            .filter(|t| t.job_id == job_id && t.status != TaskStatus::Cancelled)
            .filter_map(|t| t.rule_end_index)
            .max()
            .unwrap_or(0))
    }

    async fn next_chunk_number(&self, job_id: JobId) -> CoreResult<u32> {
        let g = self.inner.read().await;
        Ok(g.tasks.values().filter(|t| t.job_id == job_id).map(|t| t.chunk_number).max().map(|n| n + 1).unwrap_or(0))
    }

    async fn incomplete_tasks_count(&self, job_id: JobId) -> CoreResult<i64> {
        let g = self.inner.read().await;
        Ok(g.tasks.values().filter(|t| t.job_id == job_id && !t.status.is_terminal()).count() as i64)
    }

    async fn assign_task_to_agent(&self, task_id: TaskId, agent_id: AgentId) -> CoreResult<bool> {
        let mut g = self.inner.write().await;
        let busy = g
            .tasks
            .values()
            .any(|t| t.agent_id == Some(agent_id) && matches!(t.status, TaskStatus::Assigned | TaskStatus::Running));
        if busy {
            return Ok(false);
        }
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        if task.status != TaskStatus::Pending {
            return Ok(false);
        }
        task.agent_id = Some(agent_id);
        task.status = TaskStatus::Assigned;
        task.assigned_at = Some(Utc::now());
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn reset_task_to_pending(&self, task_id: TaskId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.agent_id = None;
        task.status = TaskStatus::Pending;
        task.assigned_at = None;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_task_running(&self, task_id: TaskId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Running;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_task_reconnect_pending(&self, task_id: TaskId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::ReconnectPending;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_task_retry(&self, task_id: TaskId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.retry_count += 1;
        Ok(())
    }

    async fn record_task_progress(
        &self,
        task_id: TaskId,
        keyspace_processed: u64,
        progress_percent: f32,
        checkpoint: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.keyspace_processed = keyspace_processed;
        task.progress_percent = progress_percent;
        task.last_checkpoint = Some(checkpoint);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn set_task_effective_keyspace_end(&self, task_id: TaskId, end: u64) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.effective_keyspace_end = Some(end);
        Ok(())
    }

    async fn complete_task(&self, task_id: TaskId, completed_at: DateTime<Utc>) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Completed;
        task.completed_at = Some(completed_at);
        task.progress_percent = 100.0;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_task(&self, task_id: TaskId, error_message: String) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Failed;
        task.error_message = Some(error_message);
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_task(&self, task_id: TaskId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let task = g.tasks.get_mut(&task_id).ok_or(CoreError::TaskNotFound(task_id))?;
        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn get_agent(&self, id: AgentId) -> CoreResult<Agent> {
        self.inner.read().await.agents.get(&id).cloned().ok_or(CoreError::AgentNotFound(id))
    }

    async fn insert_agent(&self, agent: Agent) -> CoreResult<()> {
        self.inner.write().await.agents.insert(agent.id, agent);
        Ok(())
    }

    async fn all_agents(&self) -> CoreResult<Vec<Agent>> {
        Ok(self.inner.read().await.agents.values().cloned().collect())
    }

    async fn agents_idle(&self) -> CoreResult<Vec<Agent>> {
        let g = self.inner.read().await;
        Ok(g.agents
            .values()
            .filter(|a| {
                a.status == AgentStatus::Active
                    && !g.tasks.values().any(|t| t.agent_id == Some(a.id) && matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
            })
            .cloned()
            .collect())
    }

    async fn update_agent_status(&self, id: AgentId, status: AgentStatus) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let agent = g.agents.get_mut(&id).ok_or(CoreError::AgentNotFound(id))?;
        agent.status = status;
        agent.updated_at = Utc::now();
        Ok(())
    }

    async fn update_agent_heartbeat(&self, id: AgentId, ip: Option<String>) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let agent = g.agents.get_mut(&id).ok_or(CoreError::AgentNotFound(id))?;
        agent.last_heartbeat = Some(Utc::now());
        if let Some(ip) = ip {
            agent.last_seen_ip = Some(ip);
        }
        agent.updated_at = Utc::now();
        Ok(())
    }

    async fn update_agent_metadata(&self, id: AgentId, metadata: AgentMetadata) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let agent = g.agents.get_mut(&id).ok_or(CoreError::AgentNotFound(id))?;
        agent.metadata = metadata;
        agent.updated_at = Utc::now();
        Ok(())
    }

    async fn increment_agent_consecutive_failures(&self, id: AgentId) -> CoreResult<u32> {
        let mut g = self.inner.write().await;
        let agent = g.agents.get_mut(&id).ok_or(CoreError::AgentNotFound(id))?;
        agent.metadata.consecutive_failures += 1;
        Ok(agent.metadata.consecutive_failures)
    }

    async fn reset_agent_consecutive_failures(&self, id: AgentId) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        let agent = g.agents.get_mut(&id).ok_or(CoreError::AgentNotFound(id))?;
        agent.metadata.consecutive_failures = 0;
        Ok(())
    }

    async fn list_devices(&self, agent_id: AgentId) -> CoreResult<Vec<Device>> {
        Ok(self.inner.read().await.devices.get(&agent_id).cloned().unwrap_or_default())
    }

    async fn upsert_devices(&self, agent_id: AgentId, devices: Vec<Device>) -> CoreResult<()> {
        self.inner.write().await.devices.insert(agent_id, devices);
        Ok(())
    }

    async fn set_device_enabled(&self, device_id: i32, enabled: bool) -> CoreResult<()> {
        let mut g = self.inner.write().await;
        for devices in g.devices.values_mut() {
            if let Some(d) = devices.iter_mut().find(|d| d.id == device_id) {
                d.enabled = enabled;
            }
        }
        Ok(())
    }

    async fn get_hashlist(&self, id: HashlistId) -> CoreResult<Hashlist> {
        self.inner.read().await.hashlists.get(&id).cloned().ok_or(CoreError::HashlistNotFound(id))
    }

    async fn insert_hashlist(&self, hashlist: Hashlist) -> CoreResult<()> {
        self.inner.write().await.hashlists.insert(hashlist.id, hashlist);
        Ok(())
    }

    async fn increment_cracked(&self, hashlist_id: HashlistId, amount: i64) -> CoreResult<Hashlist> {
        let mut g = self.inner.write().await;
        let hashlist = g.hashlists.get_mut(&hashlist_id).ok_or(CoreError::HashlistNotFound(hashlist_id))?;
        hashlist.cracked_hashes = (hashlist.cracked_hashes + amount).min(hashlist.total_hashes);
        Ok(hashlist.clone())
    }

    async fn insert_crack(&self, crack: Crack) -> CoreResult<()> {
        self.inner.write().await.cracks.push(crack);
        Ok(())
    }

    async fn pending_jobs_for_hashlist(&self, hashlist_id: HashlistId) -> CoreResult<Vec<JobExecution>> {
        let g = self.inner.read().await;
        Ok(g.jobs
            .values()
            .filter(|j| j.hashlist_id == hashlist_id && matches!(j.status, JobStatus::Pending | JobStatus::Paused))
            .cloned()
            .collect())
    }

    async fn running_tasks_for_hashlist(&self, hashlist_id: HashlistId) -> CoreResult<Vec<JobTask>> {
        let g = self.inner.read().await;
        Ok(g.tasks
            .values()
            .filter(|t| {
                matches!(t.status, TaskStatus::Assigned | TaskStatus::Running)
                    && g.jobs.get(&t.job_id).map(|j| j.hashlist_id == hashlist_id).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn get_benchmark(&self, key: BenchmarkKey) -> CoreResult<Option<BenchmarkEntry>> {
        Ok(self.inner.read().await.benchmarks.get(&key).cloned())
    }

    async fn upsert_benchmark(&self, entry: BenchmarkEntry) -> CoreResult<()> {
        let key = (entry.agent_id, entry.attack_mode, entry.hash_type);
        self.inner.write().await.benchmarks.insert(key, entry);
        Ok(())
    }
}

fn active_agents_for_job(tables: &MemTables, job_id: JobId) -> u32 {
    let mut agents: Vec<AgentId> = tables
        .tasks
        .values()
        .filter(|t| t.job_id == job_id && matches!(t.status, TaskStatus::Assigned | TaskStatus::Running))
        .filter_map(|t| t.agent_id)
        .collect();
    agents.sort_unstable();
    agents.dedup();
    agents.len() as u32
}
