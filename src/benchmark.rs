//! Benchmark cache (spec.md §4.3, component C3).
//!
//! The sole input to chunk sizing: a measured hash rate per
//! (agent, attack-mode, hash-type), with a TTL. Freshness and the
//! pending-benchmark-request bookkeeping live here; persistence of the
//! measured speed itself is delegated to `Store::get_benchmark` /
//! `upsert_benchmark` so a restart doesn't lose history.

use chrono::{DateTime, Duration, Utc};

use crate::error::CoreResult;
use crate::persistence::Store;
use crate::types::{AgentId, AgentMetadata, BenchmarkEntry, BenchmarkKey, JobId};

/// How long a pending benchmark request is honoured before it's considered
/// abandoned and may be re-requested (spec.md §4.3, §5).
pub const PENDING_BENCHMARK_TIMEOUT_MINUTES: i64 = 5;

/// Whether a stored benchmark entry is fresh enough to schedule against.
pub fn is_recent(entry: &BenchmarkEntry, ttl: Duration, now: DateTime<Utc>) -> bool {
    now - entry.updated_at < ttl
}

/// Looks up the benchmark for `key` and reports whether the agent needs a
/// fresh benchmark before work can be assigned. Returns `Ok(None)` when a
/// fresh benchmark exists (speed to use), or `Ok(Some(()))`-shaped results
/// are avoided in favour of a small enum for call-site clarity.
pub enum BenchmarkLookup {
    /// A fresh benchmark exists; chunk planning may use this speed.
    Fresh(f64),
    /// No usable benchmark; the caller should request one and defer
    /// assignment.
    NeedsRequest,
}

pub async fn lookup(
    store: &dyn Store,
    key: BenchmarkKey,
    ttl_hours: u32,
    now: DateTime<Utc>,
) -> CoreResult<BenchmarkLookup> {
    let ttl = Duration::hours(ttl_hours as i64);
    match store.get_benchmark(key).await? {
        Some(entry) if is_recent(&entry, ttl, now) => Ok(BenchmarkLookup::Fresh(entry.speed)),
        _ => Ok(BenchmarkLookup::NeedsRequest),
    }
}

/// Records that a benchmark was just requested from an agent for a job,
/// mutating the agent's metadata in place (spec.md §4.3).
pub fn mark_requested(metadata: &mut AgentMetadata, job_id: JobId, now: DateTime<Utc>) {
    metadata.pending_benchmark_job = Some(job_id);
    metadata.benchmark_requested_at = Some(now);
}

/// Clears the pending-benchmark marker, either because a result arrived or
/// because the request has been abandoned for too long.
pub fn clear_pending(metadata: &mut AgentMetadata) {
    metadata.pending_benchmark_job = None;
    metadata.benchmark_requested_at = None;
}

/// True when the agent's pending-benchmark marker has outlived
/// `PENDING_BENCHMARK_TIMEOUT_MINUTES` and should be treated as abandoned.
pub fn pending_request_expired(metadata: &AgentMetadata, now: DateTime<Utc>) -> bool {
    match metadata.benchmark_requested_at {
        Some(requested_at) => now - requested_at > Duration::minutes(PENDING_BENCHMARK_TIMEOUT_MINUTES),
        None => false,
    }
}

/// Applies an incoming `benchmark_result` message: upserts the cache and
/// clears the pending marker on the agent's metadata.
pub async fn record_result(
    store: &dyn Store,
    agent_id: AgentId,
    attack_mode: i32,
    hash_type: i32,
    speed: f64,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    store
        .upsert_benchmark(BenchmarkEntry {
            agent_id,
            attack_mode,
            hash_type,
            speed,
            updated_at: now,
        })
        .await?;
    let mut agent = store.get_agent(agent_id).await?;
    clear_pending(&mut agent.metadata);
    store.update_agent_metadata(agent_id, agent.metadata).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemStore;

    #[tokio::test]
    async fn missing_benchmark_needs_request() {
        let store = MemStore::new();
        let lookup = lookup(&store, (1, 3, 1000), 168, Utc::now()).await.unwrap();
        assert!(matches!(lookup, BenchmarkLookup::NeedsRequest));
    }

    #[test]
    fn stale_benchmark_is_not_recent() {
        let entry = BenchmarkEntry {
            agent_id: 1,
            attack_mode: 3,
            hash_type: 1000,
            speed: 1000.0,
            updated_at: Utc::now() - Duration::hours(200),
        };
        assert!(!is_recent(&entry, Duration::hours(168), Utc::now()));
    }

    #[test]
    fn pending_request_times_out_after_five_minutes() {
        let mut metadata = AgentMetadata::default();
        mark_requested(&mut metadata, JobId::nil(), Utc::now() - Duration::minutes(6));
        assert!(pending_request_expired(&metadata, Utc::now()));
    }
}
