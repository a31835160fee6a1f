//! Interval triggers that enqueue jobs.
//!
//! Runs as its own task beside the worker and talks to it only through the
//! queue. Time is cut into slots of `every_secs`; each trigger enqueues with
//! the idempotency key `<trigger id>:<slot>`, so several scheduler processes
//! produce one job per slot while that job is pending, running or completed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::{EnqueueOptions, EnqueueOutcome, QueueError, QueueResult, SharedJobQueue};

pub const DEFAULT_TICK: Duration = Duration::from_secs(5);

/// A job enqueued once per interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub job_type: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    pub every_secs: u64,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Trigger {
    pub fn validate(&self) -> QueueResult<()> {
        if self.id.trim().is_empty() {
            return Err(QueueError::Invalid("trigger id must not be empty".into()));
        }
        if self.every_secs == 0 {
            return Err(QueueError::Invalid(format!(
                "trigger {} must have every_secs > 0",
                self.id
            )));
        }
        Ok(())
    }

    /// Slot number containing `now`.
    pub fn slot(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp().div_euclid(self.every_secs.max(1) as i64)
    }

    pub fn idempotency_key(&self, slot: i64) -> String {
        format!("{}:{}", self.id, slot)
    }
}

pub struct Scheduler {
    queue: SharedJobQueue,
    triggers: Vec<Trigger>,
    tick: Duration,
    /// Last slot enqueued per trigger by this process.
    last_slot: Mutex<HashMap<String, i64>>,
}

impl Scheduler {
    pub fn new(queue: SharedJobQueue, triggers: Vec<Trigger>) -> QueueResult<Self> {
        for trigger in &triggers {
            trigger.validate()?;
        }
        Ok(Self {
            queue,
            triggers,
            tick: DEFAULT_TICK,
            last_slot: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Enqueue every trigger whose current slot has not been enqueued yet.
    pub fn enqueue_due(&self, now: DateTime<Utc>) -> QueueResult<Vec<EnqueueOutcome>> {
        let mut outcomes = Vec::new();
        for trigger in &self.triggers {
            let slot = trigger.slot(now);
            {
                let last = self.last_slot.lock().map_err(|_| QueueError::LockPoisoned)?;
                if last.get(&trigger.id) == Some(&slot) {
                    continue;
                }
            }

            let outcome = self.queue.enqueue(
                &trigger.job_type,
                trigger.payload.clone(),
                EnqueueOptions::default().idempotency_key(trigger.idempotency_key(slot)),
            )?;
            if outcome.deduped {
                debug!(trigger = %trigger.id, slot, "Trigger slot already enqueued");
            } else {
                info!(trigger = %trigger.id, slot, job_id = %outcome.job.id, "Trigger enqueued");
            }

            self.last_slot
                .lock()
                .map_err(|_| QueueError::LockPoisoned)?
                .insert(trigger.id.clone(), slot);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Tick until cancelled. Enqueue errors are logged and retried next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        if self.triggers.is_empty() {
            debug!("No triggers configured, scheduler idle");
            return;
        }
        info!(triggers = self.triggers.len(), tick = ?self.tick, "Scheduler started");
        loop {
            if let Err(e) = self.enqueue_due(Utc::now()) {
                warn!(error = %e, "Scheduled enqueue failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{JobFilter, JobQueue, MemoryJobQueue};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn trigger() -> Trigger {
        Trigger {
            id: "nightly".into(),
            job_type: "RUN_DEBATE".into(),
            payload: json!({"debateId": "d1"}),
            every_secs: 60,
        }
    }

    #[test]
    fn test_one_job_per_slot_across_schedulers() {
        let queue: SharedJobQueue = Arc::new(MemoryJobQueue::new());
        let a = Scheduler::new(queue.clone(), vec![trigger()]).unwrap();
        let b = Scheduler::new(queue.clone(), vec![trigger()]).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 30).unwrap();

        let first = a.enqueue_due(now).unwrap();
        let second = b.enqueue_due(now).unwrap();
        assert!(!first[0].deduped);
        assert!(second[0].deduped);
        assert_eq!(first[0].job.id, second[0].job.id);

        // Same process, same slot: not even attempted.
        assert!(a.enqueue_due(now).unwrap().is_empty());

        let next_slot = now + chrono::Duration::seconds(60);
        let third = a.enqueue_due(next_slot).unwrap();
        assert!(!third[0].deduped);
        assert_eq!(queue.list(&JobFilter::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_slot_key() {
        let t = trigger();
        let now = Utc.with_ymd_and_hms(1970, 1, 1, 0, 2, 0).unwrap();
        assert_eq!(t.slot(now), 2);
        assert_eq!(t.idempotency_key(2), "nightly:2");
    }

    #[test]
    fn test_invalid_trigger_rejected() {
        let queue: SharedJobQueue = Arc::new(MemoryJobQueue::new());
        let bad = Trigger {
            every_secs: 0,
            ..trigger()
        };
        assert!(Scheduler::new(queue, vec![bad]).is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let queue: SharedJobQueue = Arc::new(MemoryJobQueue::new());
        let scheduler = Scheduler::new(queue.clone(), vec![trigger()])
            .unwrap()
            .with_tick(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.run(cancel).await;
        assert_eq!(queue.list(&JobFilter::default()).unwrap().len(), 1);
    }
}
