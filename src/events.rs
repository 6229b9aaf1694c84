//! Scheduler event log, grounded on the teacher's `audit_logging.rs`.
//!
//! The spec talks about "recording the interruption event" and "emitting a
//! completion event" without prescribing storage; this gives those sentences
//! a concrete, structured home rather than leaving them as bare `tracing`
//! calls with no queryable record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::types::{AgentId, JobId, TaskId};

/// One recorded scheduler event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub job_id: JobId,
    pub task_id: Option<TaskId>,
    pub agent_id: Option<AgentId>,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Interruption,
    Completion,
    JobFailed,
}

/// Append-only, in-process event log. A production deployment would ship
/// these to durable storage or a message bus; the core only needs a
/// queryable recent-events buffer for the read-only status surface.
pub struct EventLog {
    events: RwLock<Vec<Event>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub async fn record(&self, event: Event) {
        let mut events = self.events.write().await;
        events.push(event);
        if events.len() > self.capacity {
            let overflow = events.len() - self.capacity;
            events.drain(0..overflow);
        }
    }

    pub async fn interruption(&self, job_id: JobId, task_id: TaskId, agent_id: AgentId, reason: &str) {
        self.record(Event {
            kind: EventKind::Interruption,
            job_id,
            task_id: Some(task_id),
            agent_id: Some(agent_id),
            detail: reason.to_string(),
            at: Utc::now(),
        })
        .await;
    }

    pub async fn completion(&self, job_id: JobId) {
        self.record(Event {
            kind: EventKind::Completion,
            job_id,
            task_id: None,
            agent_id: None,
            detail: "hashlist fully cracked".to_string(),
            at: Utc::now(),
        })
        .await;
    }

    pub async fn job_failed(&self, job_id: JobId, reason: &str) {
        self.record(Event {
            kind: EventKind::JobFailed,
            job_id,
            task_id: None,
            agent_id: None,
            detail: reason.to_string(),
            at: Utc::now(),
        })
        .await;
    }

    pub async fn recent(&self, limit: usize) -> Vec<Event> {
        let events = self.events.read().await;
        events.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn records_and_bounds_capacity() {
        let log = EventLog::new(2);
        for _ in 0..5 {
            log.completion(Uuid::new_v4()).await;
        }
        assert_eq!(log.recent(10).await.len(), 2);
    }
}
