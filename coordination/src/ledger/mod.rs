//! Run ledger: append-only events plus mutable run snapshots
//!
//! - [`EventLog`]: immutable JSONL event records, one segment per UTC day
//! - [`RunRepository`]: one merge-upserted snapshot per run
//! - [`summarize_run_events`]: status, duration, token and cost totals
//!   derived from a run's events
//!
//! [`Ledger::list_runs`] combines the event-derived view with the queue so a
//! job is observable before it has produced any event.

pub mod event;
pub mod log;
pub mod pricing;
pub mod runs;
pub mod summary;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub use event::{format_timestamp, EventLevel, EventRecord, EventType};
pub use log::{EventLog, EventQuery};
pub use pricing::{estimate_cost_usd, price_for, ModelPrice};
pub use runs::{Run, RunPatch, RunRepository, RunStatus, TokenUsage};
pub use summary::{summarize_job, summarize_run_events, usage_from_data, RunSummary, SummarySource};

use crate::debate::SessionStoreError;
use crate::queue::{JobFilter, JobQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid ledger record: {0}")]
    Invalid(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Session store error: {0}")]
    Sessions(#[from] SessionStoreError),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "LEDGER_IO",
            Self::Serialization(_) => "LEDGER_SERIALIZATION",
            Self::Invalid(_) => "VALIDATION_ERROR",
            Self::Queue(e) => e.code(),
            Self::Sessions(e) => e.code(),
            Self::LockPoisoned => "LEDGER_LOCK_POISONED",
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// Event log and run repository opened over one data directory.
#[derive(Clone)]
pub struct Ledger {
    pub events: Arc<EventLog>,
    pub runs: Arc<RunRepository>,
}

impl Ledger {
    pub fn open(root: impl AsRef<std::path::Path>) -> LedgerResult<Self> {
        let root = root.as_ref();
        Ok(Self {
            events: Arc::new(EventLog::open(root)?),
            runs: Arc::new(RunRepository::open(root)?),
        })
    }

    /// Runs by most recent activity: one summary per run seen in the event
    /// log, plus a queue-derived summary for every job with no events yet.
    /// `limit == 0` returns all.
    pub fn list_runs(&self, queue: &dyn JobQueue, limit: usize) -> LedgerResult<Vec<RunSummary>> {
        let events = self.events.list_events(&EventQuery::default())?;

        let mut by_run: HashMap<&str, Vec<EventRecord>> = HashMap::new();
        for event in &events {
            if let Some(run_id) = event.run_id.as_deref() {
                by_run.entry(run_id).or_default().push(event.clone());
            }
        }

        let mut summaries: Vec<RunSummary> = by_run
            .iter()
            .map(|(run_id, events)| summarize_run_events(run_id, events))
            .collect();

        let seen: HashSet<String> = summaries.iter().map(|s| s.run_id.clone()).collect();
        for job in queue.list(&JobFilter::default())? {
            if !seen.contains(&job.run_id) {
                summaries.push(summarize_job(&job));
            }
        }

        summaries.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        if limit > 0 {
            summaries.truncate(limit);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EnqueueOptions, MemoryJobQueue};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_list_runs_includes_pending_jobs() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        let queue = MemoryJobQueue::new();

        let pending = queue
            .enqueue("RUN_DEBATE", json!({"debateId": "d1"}), EnqueueOptions::default())
            .unwrap()
            .job;
        let started = queue
            .enqueue("RUN_DEBATE", json!({"debateId": "d2"}), EnqueueOptions::default())
            .unwrap()
            .job;
        ledger
            .events
            .append_event(EventRecord::new(EventType::RunStarted, "worker").run_id(&started.run_id))
            .unwrap();

        let runs = ledger.list_runs(&queue, 0).unwrap();
        assert_eq!(runs.len(), 2);

        let queued = runs.iter().find(|r| r.run_id == pending.run_id).unwrap();
        assert_eq!(queued.status, RunStatus::Queued);
        assert_eq!(queued.source, SummarySource::Queue);

        let running = runs.iter().find(|r| r.run_id == started.run_id).unwrap();
        assert_eq!(running.status, RunStatus::Running);
        assert_eq!(running.source, SummarySource::Events);
    }
}
