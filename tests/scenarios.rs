//! Scenario-level integration tests (spec.md §8) exercising `JobScheduler`
//! end-to-end against the in-memory `MemStore`. Scenario A and the no-idle-
//! means-no-interruption converse of Scenario C already live as unit tests
//! in `src/scheduler.rs`; this file covers the remaining scenarios that need
//! a full multi-tick, multi-agent setup.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use krakenhashes_core::events::EventLog;
use krakenhashes_core::filesync::DataDir;
use krakenhashes_core::persistence::{MemStore, Store};
use krakenhashes_core::planner;
use krakenhashes_core::scheduler::{JobScheduler, SchedulerSettings};
use krakenhashes_core::session::SessionRegistry;
use krakenhashes_core::types::{
    Agent, AgentId, AgentMetadata, AgentStatus, BenchmarkEntry, Crack, Hashlist, JobExecution,
    JobStatus, Priority, TaskStatus,
};

fn settings() -> SchedulerSettings {
    SchedulerSettings::default()
}

fn sample_hashlist(total: i64) -> Hashlist {
    Hashlist {
        id: Uuid::new_v4(),
        name: "hashlist".into(),
        hash_type: 1000,
        total_hashes: total,
        cracked_hashes: 0,
        file_path: "h.txt".into(),
    }
}

fn sample_job(hashlist_id: Uuid, priority: Priority, max_agents: u32, allow_override: bool) -> JobExecution {
    let now = Utc::now();
    JobExecution {
        id: Uuid::new_v4(),
        name: "job".into(),
        status: JobStatus::Pending,
        priority,
        max_agents,
        allow_high_priority_override: allow_override,
        hashlist_id,
        attack_mode: 3,
        hash_type: 1000,
        binary_version_id: Uuid::new_v4(),
        wordlist_ids: vec![],
        rule_ids: vec![],
        base_keyspace: 1_000_000,
        multiplication_factor: 1,
        effective_keyspace: 1_000_000,
        total_keyspace: 1_000_000,
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

fn scheduler_with_data_dir(store: Arc<MemStore>, data_dir: DataDir, rule_chunk_temp_dir: std::path::PathBuf) -> JobScheduler {
    let mut settings = SchedulerSettings::default();
    settings.rule_chunk_temp_dir = rule_chunk_temp_dir;
    JobScheduler::new(store, Arc::new(SessionRegistry::new()), Arc::new(EventLog::default()), data_dir, settings)
}

async fn give_benchmark(store: &MemStore, agent_id: AgentId, attack_mode: i32, hash_type: i32, speed: f64) {
    store
        .upsert_benchmark(BenchmarkEntry {
            agent_id,
            attack_mode,
            hash_type,
            speed,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
}

/// Scenario C — high-priority preemption (spec.md §8).
///
/// All agents are busy on a low-priority job; a high-priority job with
/// `allow_high_priority_override=true` and `max_agents=1` arrives. With no
/// idle agent, the next tick's interruption pass stops the low-priority
/// job's running task and hands the freed agent to the high-priority job.
#[tokio::test]
async fn scenario_c_high_priority_preemption() {
    let store = Arc::new(MemStore::new());
    let hashlist_low = sample_hashlist(1000);
    let hashlist_hi = sample_hashlist(1000);
    store.insert_hashlist(hashlist_low.clone()).await.unwrap();
    store.insert_hashlist(hashlist_hi.clone()).await.unwrap();

    let low_job = sample_job(hashlist_low.id, 10, 0, true);
    store.insert_job(low_job.clone()).await.unwrap();

    let agent = sample_agent(1);
    store.insert_agent(agent.clone()).await.unwrap();
    give_benchmark(&store, 1, low_job.attack_mode, low_job.hash_type, 1_000.0).await;

    // Saturate the only agent on the low-priority job first.
    let scheduler = scheduler_with(store.clone()).await;
    scheduler.tick().await.unwrap();
    let low_tasks = store.tasks_by_job(low_job.id).await.unwrap();
    assert_eq!(low_tasks.len(), 1);
    store.mark_task_running(low_tasks[0].id).await.unwrap();

    // Now the high-priority job arrives.
    let hi_job = sample_job(hashlist_hi.id, 90, 1, true);
    store.insert_job(hi_job.clone()).await.unwrap();
    give_benchmark(&store, 1, hi_job.attack_mode, hi_job.hash_type, 1_000.0).await;

    // No idle agents: the tick's interruption pass should fire.
    scheduler.tick().await.unwrap();

    let low_task_after = store.get_task(low_tasks[0].id).await.unwrap();
    assert_eq!(low_task_after.status, TaskStatus::Pending);
    assert_eq!(low_task_after.agent_id, None);

    let hi_tasks = store.tasks_by_job(hi_job.id).await.unwrap();
    assert_eq!(hi_tasks.len(), 1);
    assert_eq!(hi_tasks[0].agent_id, Some(1));
    assert_eq!(store.get_job(hi_job.id).await.unwrap().status, JobStatus::Running);
}

/// Scenario C (converse guard) — a job with `allow_high_priority_override=
/// false` never triggers interruption, no matter its priority.
#[tokio::test]
async fn non_overridable_high_priority_job_does_not_preempt() {
    let store = Arc::new(MemStore::new());
    let hashlist_low = sample_hashlist(1000);
    let hashlist_hi = sample_hashlist(1000);
    store.insert_hashlist(hashlist_low.clone()).await.unwrap();
    store.insert_hashlist(hashlist_hi.clone()).await.unwrap();

    let low_job = sample_job(hashlist_low.id, 10, 0, true);
    store.insert_job(low_job.clone()).await.unwrap();
    let agent = sample_agent(1);
    store.insert_agent(agent.clone()).await.unwrap();
    give_benchmark(&store, 1, low_job.attack_mode, low_job.hash_type, 1_000.0).await;

    let scheduler = scheduler_with(store.clone()).await;
    scheduler.tick().await.unwrap();
    let low_tasks = store.tasks_by_job(low_job.id).await.unwrap();
    store.mark_task_running(low_tasks[0].id).await.unwrap();

    // High priority but not eligible to force-preempt.
    let hi_job = sample_job(hashlist_hi.id, 90, 1, false);
    store.insert_job(hi_job.clone()).await.unwrap();
    give_benchmark(&store, 1, hi_job.attack_mode, hi_job.hash_type, 1_000.0).await;

    scheduler.tick().await.unwrap();

    let low_task_after = store.get_task(low_tasks[0].id).await.unwrap();
    assert_eq!(low_task_after.status, TaskStatus::Running, "non-overridable job must not preempt");
    let hi_tasks = store.tasks_by_job(hi_job.id).await.unwrap();
    assert!(hi_tasks.is_empty());
}

/// Scenario D — agent crash mid-task (spec.md §8).
///
/// A running task's agent goes quiet (heartbeat-driven `inactive`, no fresh
/// checkpoint). The housekeeping sweep resets the task to `pending` with no
/// agent; the scheduler's pick-up-existing-task preference order then
/// rebinds it to a second, idle agent via the `unassigned_pending_task`
/// fallback (the task is pending but not yet stale by the 5-minute
/// threshold, since it was just reset).
#[tokio::test]
async fn scenario_d_agent_crash_recovers_via_stale_pending_pickup() {
    let store = Arc::new(MemStore::new());
    let hashlist = sample_hashlist(1000);
    store.insert_hashlist(hashlist.clone()).await.unwrap();
    // Keyspace larger than the one dispatched chunk, so the job stays
    // eligible in `next_jobs_with_available_work` after that chunk is
    // reserved — otherwise the crashed task would have nothing left to pick
    // back up against.
    let mut job = sample_job(hashlist.id, 0, 0, true);
    job.effective_keyspace = 2_000_000;
    job.total_keyspace = 2_000_000;
    store.insert_job(job.clone()).await.unwrap();

    let crashed_agent = sample_agent(1);
    store.insert_agent(crashed_agent.clone()).await.unwrap();
    give_benchmark(&store, 1, job.attack_mode, job.hash_type, 1_000.0).await;

    let chunk = planner::PlannedChunk { keyspace_start: 0, keyspace_end: 1_000_000, chunk_number: 0 };
    let mut task = planner::build_task(&job, &chunk, "hashcat".into(), 1_000.0);
    store.insert_task(task.clone()).await.unwrap();
    store.assign_task_to_agent(task.id, 1).await.unwrap();
    store.mark_task_running(task.id).await.unwrap();
    task.keyspace_processed = 500;
    store
        .record_task_progress(task.id, 500, 0.05, Utc::now() - Duration::minutes(10))
        .await
        .unwrap();

    // The agent goes quiet; mark it inactive as the session layer would on
    // heartbeat loss.
    store.update_agent_status(1, AgentStatus::Inactive).await.unwrap();

    let scheduler = scheduler_with(store.clone()).await;
    // Housekeeping: stale checkpoint (10 minutes old, past the 5-minute
    // `stale_assignment_timeout`) resets the task to pending.
    scheduler.housekeeping().await.unwrap();

    let after_sweep = store.get_task(task.id).await.unwrap();
    assert_eq!(after_sweep.status, TaskStatus::Pending);
    assert_eq!(after_sweep.agent_id, None);
    // Original progress is not discarded, but also not re-credited as part
    // of a fresh dispatch; the counter simply reflects what was last
    // reported.
    assert_eq!(after_sweep.keyspace_processed, 500);

    // A second, idle agent appears and should pick the stale task back up.
    let fresh_agent = sample_agent(2);
    store.insert_agent(fresh_agent.clone()).await.unwrap();
    give_benchmark(&store, 2, job.attack_mode, job.hash_type, 1_000.0).await;

    // The task was just reset, so it isn't old enough for `stale_pending_task`
    // yet; `unassigned_pending_task` still finds it (pending, no agent) and
    // the agent picks it up on this tick.
    scheduler.tick().await.unwrap();

    let picked_up = store.get_task(task.id).await.unwrap();
    assert_eq!(picked_up.agent_id, Some(2));
    assert_ne!(picked_up.status, TaskStatus::Pending);
}

/// Scenario E — all hashes cracked (spec.md §8).
///
/// A crack pushes `cracked_hashes` to `total_hashes`; the completion handler
/// stops every other running task against the hashlist, marks them
/// completed, deletes any pending job still targeting it, and marks this
/// job completed too.
#[tokio::test]
async fn scenario_e_all_hashes_cracked_stops_everything() {
    let store = Arc::new(MemStore::new());
    let hashlist = sample_hashlist(3);
    store.insert_hashlist(hashlist.clone()).await.unwrap();

    let job_a = sample_job(hashlist.id, 50, 0, true);
    let job_b = sample_job(hashlist.id, 10, 0, true);
    store.insert_job(job_a.clone()).await.unwrap();
    store.insert_job(job_b.clone()).await.unwrap(); // still pending

    let agent = sample_agent(1);
    store.insert_agent(agent.clone()).await.unwrap();

    let sessions = SessionRegistry::new();
    let (tx, mut rx) = tokio::sync::mpsc::channel(8);
    sessions.register(1, tx).await;

    let chunk = planner::PlannedChunk { keyspace_start: 0, keyspace_end: 1_000_000, chunk_number: 0 };
    let task = planner::build_task(&job_a, &chunk, "hashcat".into(), 1_000.0);
    store.insert_task(task.clone()).await.unwrap();
    store.assign_task_to_agent(task.id, 1).await.unwrap();
    store.mark_task_running(task.id).await.unwrap();

    // Two cracks already recorded elsewhere, this is the third and final one.
    store.increment_cracked(hashlist.id, 2).await.unwrap();
    store
        .insert_crack(Crack {
            hash_id: Uuid::new_v4(),
            hashlist_id: hashlist.id,
            plaintext: "password3".into(),
            task_id: task.id,
            cracked_at: Utc::now(),
        })
        .await
        .unwrap();
    let after = store.increment_cracked(hashlist.id, 1).await.unwrap();
    assert!(after.fully_cracked());

    let events = EventLog::default();
    krakenhashes_core::lifecycle::handle_hashlist_complete(store.as_ref(), &events, &sessions, hashlist.id)
        .await
        .unwrap();

    let task_after = store.get_task(task.id).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Completed);
    assert_eq!(store.get_job(job_a.id).await.unwrap().status, JobStatus::Completed);
    // job_b was pending and targeted the same hashlist: deleted.
    assert!(store.get_job(job_b.id).await.is_err());

    // The agent's other running task on this hashlist got a job_stop.
    let sent = rx.try_recv().expect("expected a job_stop for the agent's running task");
    match sent {
        krakenhashes_core::session::ServerMessage::JobStop { task_id, .. } => assert_eq!(task_id, task.id),
        other => panic!("expected JobStop, got {other:?}"),
    }

    // Idempotent: running it again is a no-op, no panics, nothing left to touch.
    krakenhashes_core::lifecycle::handle_hashlist_complete(store.as_ref(), &events, &sessions, hashlist.id)
        .await
        .unwrap();
}

/// Scenario F — benchmark required (spec.md §8).
///
/// A brand new job with `is_accurate_keyspace=false` and no existing tasks
/// never gets a task before the agent's benchmark for its (attack-mode,
/// hash-type) is fresh. Once `benchmark_result` lands, the very next tick
/// dispatches the first real task.
#[tokio::test]
async fn scenario_f_benchmark_required_before_first_dispatch() {
    let store = Arc::new(MemStore::new());
    let hashlist = sample_hashlist(1000);
    store.insert_hashlist(hashlist.clone()).await.unwrap();

    let mut job = sample_job(hashlist.id, 0, 0, true);
    job.is_accurate_keyspace = false;
    store.insert_job(job.clone()).await.unwrap();

    let agent = sample_agent(3);
    store.insert_agent(agent.clone()).await.unwrap();

    let scheduler = scheduler_with(store.clone()).await;
    scheduler.tick().await.unwrap();

    // No benchmark yet: no task dispatched, but the pending-benchmark marker
    // is set on the agent.
    let tasks = store.tasks_by_job(job.id).await.unwrap();
    assert!(tasks.is_empty());
    let agent_after = store.get_agent(3).await.unwrap();
    assert_eq!(agent_after.metadata.pending_benchmark_job, Some(job.id));
    assert!(agent_after.metadata.benchmark_requested_at.is_some());

    // `benchmark_result` arrives.
    give_benchmark(&store, 3, job.attack_mode, job.hash_type, 2_000.0).await;

    scheduler.tick().await.unwrap();
    let tasks_after = store.tasks_by_job(job.id).await.unwrap();
    assert_eq!(tasks_after.len(), 1);
    assert_eq!(tasks_after[0].agent_id, Some(3));
}

/// Boundary: `max_agents=1` limits a job to strictly one concurrent agent
/// even when more idle agents are available (spec.md §8).
#[tokio::test]
async fn max_agents_one_limits_to_a_single_concurrent_agent() {
    let store = Arc::new(MemStore::new());
    let hashlist = sample_hashlist(1000);
    store.insert_hashlist(hashlist.clone()).await.unwrap();

    // A big enough keyspace that one chunk won't exhaust it, so a second
    // agent could in principle pick up more work if the cap didn't apply.
    let mut job = sample_job(hashlist.id, 0, 1, true);
    job.effective_keyspace = 1_000_000_000;
    job.total_keyspace = 1_000_000_000;
    store.insert_job(job.clone()).await.unwrap();

    let agent1 = sample_agent(1);
    let agent2 = sample_agent(2);
    store.insert_agent(agent1.clone()).await.unwrap();
    store.insert_agent(agent2.clone()).await.unwrap();
    give_benchmark(&store, 1, job.attack_mode, job.hash_type, 1_000.0).await;
    give_benchmark(&store, 2, job.attack_mode, job.hash_type, 1_000.0).await;

    let scheduler = scheduler_with(store.clone()).await;
    scheduler.tick().await.unwrap();

    let tasks = store.tasks_by_job(job.id).await.unwrap();
    assert_eq!(tasks.len(), 1, "max_agents=1 must cap concurrent dispatch to a single agent");
}

/// Scenario B — straight+rules, three agents, rule splitting dispatches
/// disjoint ranges (spec.md §8).
///
/// A job already past the rule-split trigger (`uses_rule_splitting=true`,
/// `total_rules` known) hands out three 120_000-rule chunks to three idle
/// agents in one tick, starting at 0, 120_000, 240_000 — `rules_per_chunk =
/// rules_per_second(100) * chunk_duration(1200) = 120_000`.
#[tokio::test]
async fn scenario_b_rule_split_dispatches_disjoint_ranges() {
    let data_root = tempfile::tempdir().unwrap();
    let data_dir = DataDir::new(data_root.path());
    std::fs::create_dir_all(data_dir.rules()).unwrap();
    let rule_chunk_dir = tempfile::tempdir().unwrap();

    let rule_id = Uuid::new_v4();
    let rule_path = data_dir.rules().join(rule_id.to_string());
    {
        use std::io::Write;
        let mut file = std::io::BufWriter::new(std::fs::File::create(&rule_path).unwrap());
        // Enough rule lines to materialise three 120_000-rule chunks; the
        // job's `total_rules` (set below) reflects the full 10_000_000-rule
        // file this stands in for, not the line count actually on disk.
        for _ in 0..360_000u32 {
            writeln!(file, "l").unwrap();
        }
    }

    let store = Arc::new(MemStore::new());
    let hashlist = sample_hashlist(1000);
    store.insert_hashlist(hashlist.clone()).await.unwrap();

    let mut job = sample_job(hashlist.id, 0, 0, true);
    job.rule_ids = vec![rule_id];
    job.base_keyspace = 1_000_000;
    job.multiplication_factor = 10_000_000;
    job.effective_keyspace = job.base_keyspace * job.multiplication_factor;
    job.total_keyspace = job.effective_keyspace;
    job.chunk_size_seconds = 1200;
    job.uses_rule_splitting = true;
    job.total_rules = Some(10_000_000);
    store.insert_job(job.clone()).await.unwrap();

    for id in [1, 2, 3] {
        store.insert_agent(sample_agent(id)).await.unwrap();
        give_benchmark(&store, id, job.attack_mode, job.hash_type, 100_000_000.0).await;
    }

    let scheduler = scheduler_with_data_dir(store.clone(), data_dir, rule_chunk_dir.path().to_path_buf());
    scheduler.tick().await.unwrap();

    let mut tasks = store.tasks_by_job(job.id).await.unwrap();
    tasks.sort_by_key(|t| t.rule_start_index);
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.is_rule_split_task));

    let ranges: Vec<(u64, u64)> = tasks
        .iter()
        .map(|t| (t.rule_start_index.unwrap(), t.rule_end_index.unwrap()))
        .collect();
    assert_eq!(ranges, vec![(0, 120_000), (120_000, 240_000), (240_000, 360_000)]);

    let agent_ids: std::collections::HashSet<AgentId> = tasks.iter().map(|t| t.agent_id.unwrap()).collect();
    let expected_ids: std::collections::HashSet<AgentId> = [1, 2, 3].into_iter().collect();
    assert_eq!(agent_ids, expected_ids);

    // No two rule-split tasks of this job overlap (spec.md invariant 5).
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0);
    }
}
