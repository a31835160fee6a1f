//! In-memory queue. Claims are atomic because they happen under one mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use super::types::{
    DequeueOptions, EnqueueOptions, EnqueueOutcome, FailOptions, Job, JobError, JobFilter,
};
use super::{JobQueue, QueueError, QueueResult};

/// Mutex-guarded job map.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut HashMap<String, Job>) -> T) -> QueueResult<T> {
        let mut jobs = self.jobs.lock().map_err(|_| QueueError::LockPoisoned)?;
        Ok(f(&mut jobs))
    }
}

impl JobQueue for MemoryJobQueue {
    fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> QueueResult<EnqueueOutcome> {
        let now = Utc::now();
        let job = Job::new(job_type, payload, &opts, now)?;

        self.with_jobs(|jobs| {
            if let Some(key) = opts.idempotency_key.as_deref() {
                if let Some(existing) = jobs.values().find(|j| j.dedupes(key)) {
                    debug!(job_id = %existing.id, key, "Enqueue deduped");
                    return EnqueueOutcome {
                        job: existing.clone(),
                        deduped: true,
                    };
                }
            }
            info!(job_id = %job.id, job_type, "Job enqueued");
            jobs.insert(job.id.clone(), job.clone());
            EnqueueOutcome {
                job,
                deduped: false,
            }
        })
    }

    fn dequeue(&self, opts: &DequeueOptions) -> QueueResult<Option<Job>> {
        let now = Utc::now();
        self.with_jobs(|jobs| -> Option<Job> {
            let next_id = jobs
                .values()
                .filter(|job| job.is_claimable(&opts.job_types, now))
                .min_by(|a, b| a.claim_order().cmp(&b.claim_order()))
                .map(|job| job.id.clone())?;

            let job = jobs.get_mut(&next_id)?;
            if job.is_reclaim() {
                info!(job_id = %job.id, previous_worker = ?job.worker_id, "Reclaiming expired lease");
            }
            job.claim(&opts.worker_id, opts.lease_ms, now);
            Some(job.clone())
        })
    }

    fn ack(&self, job_id: &str, result: Value) -> QueueResult<Job> {
        let now = Utc::now();
        self.with_jobs(|jobs| -> QueueResult<Job> {
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
            job.complete(result, now)?;
            Ok(job.clone())
        })?
    }

    fn fail(&self, job_id: &str, error: &JobError, opts: &FailOptions) -> QueueResult<Job> {
        let now = Utc::now();
        self.with_jobs(|jobs| -> QueueResult<Job> {
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| QueueError::NotFound(job_id.to_string()))?;
            job.record_failure(error, opts, now)?;
            Ok(job.clone())
        })?
    }

    fn get(&self, job_id: &str) -> QueueResult<Option<Job>> {
        self.with_jobs(|jobs| jobs.get(job_id).cloned())
    }

    fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let jobs = self.with_jobs(|jobs| jobs.values().cloned().collect::<Vec<_>>())?;
        Ok(filter.apply(jobs))
    }
}
