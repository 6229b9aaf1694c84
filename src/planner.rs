//! Chunk planner (spec.md §4.4, component C4).
//!
//! Turns (job, agent, benchmark speed, remaining keyspace) into the next
//! keyspace slice to dispatch, or `None` when the job has no remaining work.
//! Chunk sizing and the rule-split manager (`crate::rulesplit`) both need the
//! same "absorb a too-small trailing remainder" rule (spec.md §9 DESIGN NOTES
//! item 4); `tail_absorbing_size` is the one place that rule lives.

use crate::types::{JobExecution, JobTask, Priority, TaskStatus};
use chrono::Utc;
use uuid::Uuid;

/// Given `remaining` units of work left and an `ideal` chunk size, returns
/// the chunk size to actually use: `ideal`, unless the leftover after taking
/// `ideal` would be smaller than `fluctuation_percent` of `ideal`, in which
/// case the whole remainder is absorbed into this chunk.
///
/// `ideal >= remaining` also absorbs, covering the common case where the
/// target chunk size overshoots what's left.
pub fn tail_absorbing_size(remaining: u64, ideal: u64, fluctuation_percent: u32) -> u64 {
    if ideal == 0 || ideal >= remaining {
        return remaining;
    }
    let threshold = ideal.saturating_mul(fluctuation_percent as u64) / 100;
    if remaining - ideal < threshold {
        remaining
    } else {
        ideal
    }
}

/// A freshly planned chunk, not yet persisted.
#[derive(Debug, Clone)]
pub struct PlannedChunk {
    pub keyspace_start: u64,
    pub keyspace_end: u64,
    pub chunk_number: u32,
}

/// Computes the next keyspace chunk for a job with the given remaining
/// keyspace, or `None` if there is nothing left to dispatch (spec.md §4.4
/// step 1 — the caller treats this as "no task", not an error).
pub fn plan_next_chunk(
    dispatched_keyspace: u64,
    effective_keyspace: u64,
    benchmark_speed: f64,
    chunk_duration_seconds: u32,
    fluctuation_percent: u32,
    chunk_number: u32,
) -> Option<PlannedChunk> {
    let remaining = effective_keyspace.saturating_sub(dispatched_keyspace);
    if remaining == 0 {
        return None;
    }
    let ideal = (benchmark_speed * chunk_duration_seconds as f64).max(1.0) as u64;
    let size = tail_absorbing_size(remaining, ideal, fluctuation_percent);
    Some(PlannedChunk {
        keyspace_start: dispatched_keyspace,
        keyspace_end: dispatched_keyspace + size,
        chunk_number,
    })
}

/// Builds the `JobTask` row for a newly planned chunk. Does not touch
/// storage; callers persist it via `Store::insert_task`, which performs the
/// matching atomic `dispatched_keyspace` increment.
pub fn build_task(
    job: &JobExecution,
    chunk: &PlannedChunk,
    attack_cmd: String,
    benchmark_speed: f64,
) -> JobTask {
    let now = Utc::now();
    JobTask {
        id: Uuid::new_v4(),
        job_id: job.id,
        agent_id: None,
        status: TaskStatus::Pending,
        priority: job.priority as Priority,
        attack_cmd,
        keyspace_start: chunk.keyspace_start,
        keyspace_end: chunk.keyspace_end,
        keyspace_processed: 0,
        effective_keyspace_start: Some(chunk.keyspace_start),
        effective_keyspace_end: Some(chunk.keyspace_end),
        rule_start_index: None,
        rule_end_index: None,
        rule_chunk_path: None,
        is_rule_split_task: false,
        chunk_number: chunk.chunk_number,
        chunk_duration: job.chunk_size_seconds,
        benchmark_speed: Some(benchmark_speed),
        last_checkpoint: None,
        retry_count: 0,
        assigned_at: None,
        completed_at: None,
        error_message: None,
        progress_percent: 0.0,
        created_at: now,
        updated_at: now,
    }
}

/// Estimated wall-clock time in seconds to process `effective_keyspace` at
/// `benchmark_speed` hashes/sec, used by the rule-splitting decision
/// (spec.md §4.4).
pub fn estimated_runtime_seconds(effective_keyspace: u64, benchmark_speed: f64) -> f64 {
    if benchmark_speed <= 0.0 {
        return f64::INFINITY;
    }
    effective_keyspace as f64 / benchmark_speed
}

/// Decides whether a straight+rules job should switch to rule-splitting on
/// its first dispatch (spec.md §4.4): true when the estimated runtime at the
/// given benchmark speed exceeds the target chunk duration by more than the
/// fluctuation allowance.
pub fn should_rule_split(
    effective_keyspace: u64,
    multiplication_factor: u64,
    benchmark_speed: f64,
    chunk_duration_seconds: u32,
    fluctuation_percent: u32,
) -> bool {
    if multiplication_factor <= 1 {
        return false;
    }
    let estimated = estimated_runtime_seconds(effective_keyspace, benchmark_speed);
    let threshold = chunk_duration_seconds as f64 * (1.0 + fluctuation_percent as f64 / 100.0);
    estimated > threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorbs_small_remainder() {
        // remaining 105, ideal 100, 20% fluctuation -> threshold 20, leftover 5 < 20 -> absorb.
        assert_eq!(tail_absorbing_size(105, 100, 20), 105);
    }

    #[test]
    fn does_not_absorb_large_remainder() {
        // remaining 1000, ideal 100, 20% fluctuation -> threshold 20, leftover 900 >= 20 -> no absorb.
        assert_eq!(tail_absorbing_size(1000, 100, 20), 100);
    }

    #[test]
    fn single_rule_tail_is_absorbed() {
        assert_eq!(tail_absorbing_size(1, 100, 20), 1);
    }

    #[test]
    fn scenario_a_single_chunk() {
        let chunk = plan_next_chunk(0, 10_000, 1_000.0, 20, 20, 0).unwrap();
        assert_eq!(chunk.keyspace_start, 0);
        assert_eq!(chunk.keyspace_end, 10_000);
    }

    #[test]
    fn no_remaining_keyspace_yields_no_chunk() {
        assert!(plan_next_chunk(10_000, 10_000, 1_000.0, 20, 20, 1).is_none());
    }

    #[test]
    fn rule_split_trigger_scenario_b() {
        // 10_000 rules: E = 100s, threshold = 1200*1.2 = 1440 -> no split.
        assert!(!should_rule_split(10_000_000_000, 10_000, 100_000_000.0, 1200, 20));
        // 10_000_000 rules with the same effective keyspace scale: E = 100_000s -> split.
        assert!(should_rule_split(10_000_000_000_000, 10_000_000, 100_000_000.0, 1200, 20));
    }
}
