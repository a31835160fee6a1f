//! Job records and the options accepted by the queue operations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::retry::backoff_delay_ms;
use super::QueueError;

/// Unique identifier for jobs
pub type JobId = String;

/// Default attempt budget for a job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `available_at` and a free worker.
    Pending,
    /// Claimed by a worker under a lease.
    Running,
    /// Acknowledged with a result.
    Completed,
    /// Attempts exhausted or a non-retryable error. Terminal.
    Failed,
}

impl JobStatus {
    /// Whether this is a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether an existing job in this status absorbs a duplicate enqueue.
    pub fn blocks_duplicate(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Completed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Error reported to [`JobQueue::fail`](super::JobQueue::fail).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    /// Machine-readable error code (e.g. "HANDLER_ERROR").
    pub code: String,
    pub message: String,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// The most recent failure recorded on a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    /// Delay before the job becomes eligible again, when a retry is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// Whether this failure ended the job.
    pub terminal: bool,
    pub at: DateTime<Utc>,
}

/// A durable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub run_id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub available_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh pending job.
    pub fn new(
        job_type: &str,
        payload: Value,
        opts: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Result<Self, QueueError> {
        if job_type.trim().is_empty() {
            return Err(QueueError::Invalid("job type must not be empty".into()));
        }
        if opts.max_attempts == 0 {
            return Err(QueueError::Invalid("max_attempts must be at least 1".into()));
        }

        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: opts
                .run_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: opts.max_attempts,
            idempotency_key: opts.idempotency_key.clone(),
            available_at: opts.available_at.unwrap_or(now),
            lease_until: None,
            worker_id: None,
            started_at: None,
            finished_at: None,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Whether this job absorbs an enqueue carrying `key`.
    pub fn dedupes(&self, key: &str) -> bool {
        self.idempotency_key.as_deref() == Some(key) && self.status.blocks_duplicate()
    }

    /// Whether a dequeuer allowed `job_types` may claim this job at `now`.
    ///
    /// Pending jobs become claimable once `available_at` has passed; running
    /// jobs only once their lease has expired. An empty type list allows all.
    pub fn is_claimable(&self, job_types: &[String], now: DateTime<Utc>) -> bool {
        if !job_types.is_empty() && !job_types.iter().any(|t| *t == self.job_type) {
            return false;
        }
        match self.status {
            JobStatus::Pending => self.available_at <= now,
            JobStatus::Running => self.lease_until.is_some_and(|until| until <= now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Claim order: earliest `available_at`, then earliest `created_at`.
    pub fn claim_order(&self) -> (DateTime<Utc>, DateTime<Utc>, &str) {
        (self.available_at, self.created_at, self.id.as_str())
    }

    /// Whether the current claim is a reclaim of an expired lease.
    pub fn is_reclaim(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub(crate) fn claim(&mut self, worker_id: &str, lease_ms: u64, now: DateTime<Utc>) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.lease_until = Some(now + millis(lease_ms));
        self.worker_id = Some(worker_id.to_string());
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
    }

    pub(crate) fn complete(&mut self, result: Value, now: DateTime<Utc>) -> Result<(), QueueError> {
        self.expect_running()?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.lease_until = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub(crate) fn record_failure(
        &mut self,
        error: &JobError,
        opts: &FailOptions,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.expect_running()?;

        let retry = opts.retryable && self.attempts < self.max_attempts;
        if retry {
            let delay_ms = backoff_delay_ms(opts.backoff_base_ms, self.attempts);
            self.status = JobStatus::Pending;
            self.available_at = now + millis(delay_ms);
            self.last_error = Some(JobFailure {
                code: error.code.clone(),
                message: error.message.clone(),
                retryable: true,
                retry_delay_ms: Some(delay_ms),
                terminal: false,
                at: now,
            });
        } else {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            self.last_error = Some(JobFailure {
                code: error.code.clone(),
                message: error.message.clone(),
                retryable: opts.retryable,
                retry_delay_ms: None,
                terminal: true,
                at: now,
            });
        }
        self.lease_until = None;
        self.updated_at = now;
        Ok(())
    }

    fn expect_running(&self) -> Result<(), QueueError> {
        if self.status != JobStatus::Running {
            return Err(QueueError::InvalidState {
                job_id: self.id.clone(),
                status: self.status,
                expected: JobStatus::Running,
            });
        }
        Ok(())
    }
}

/// Options for [`JobQueue::enqueue`](super::JobQueue::enqueue).
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub idempotency_key: Option<String>,
    pub max_attempts: u32,
    /// Defaults to "now".
    pub available_at: Option<DateTime<Utc>>,
    /// Defaults to a fresh id.
    pub run_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            idempotency_key: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            available_at: None,
            run_id: None,
        }
    }
}

impl EnqueueOptions {
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, Serialize)]
pub struct EnqueueOutcome {
    pub job: Job,
    /// True when an existing job with the same idempotency key was returned.
    pub deduped: bool,
}

/// Options for [`JobQueue::dequeue`](super::JobQueue::dequeue).
#[derive(Debug, Clone)]
pub struct DequeueOptions {
    pub worker_id: String,
    /// Allowed job types. Empty allows every type.
    pub job_types: Vec<String>,
    pub lease_ms: u64,
}

/// Options for [`JobQueue::fail`](super::JobQueue::fail).
#[derive(Debug, Clone, Copy)]
pub struct FailOptions {
    pub backoff_base_ms: u64,
    /// Non-retryable failures end the job regardless of remaining attempts.
    pub retryable: bool,
}

impl FailOptions {
    pub fn retryable(backoff_base_ms: u64) -> Self {
        Self {
            backoff_base_ms,
            retryable: true,
        }
    }

    pub fn terminal() -> Self {
        Self {
            backoff_base_ms: 0,
            retryable: false,
        }
    }
}

/// Filter for [`JobQueue::list`](super::JobQueue::list).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    /// Zero means unlimited.
    pub limit: usize,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |status| job.status == status)
            && self
                .job_type
                .as_deref()
                .map_or(true, |job_type| job.job_type == job_type)
    }

    /// Sort newest first and apply the limit.
    pub fn apply(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.retain(|job| self.matches(job));
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        if self.limit > 0 {
            jobs.truncate(self.limit);
        }
        jobs
    }
}

/// Upper bound on any lease or backoff delay (~100 years).
const MAX_DELAY_MS: u64 = 100 * 365 * 24 * 60 * 60 * 1_000;

pub(crate) fn millis(ms: u64) -> Duration {
    Duration::milliseconds(ms.min(MAX_DELAY_MS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_job() -> Job {
        Job::new(
            "RUN_DEBATE",
            json!({"debateId": "d1"}),
            &EnqueueOptions::default(),
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_new_job_defaults() {
        let job = pending_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.lease_until.is_none());
        assert!(!job.run_id.is_empty());
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let err = Job::new(
            "RUN_DEBATE",
            json!({}),
            &EnqueueOptions::default().max_attempts(0),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, QueueError::Invalid(_)));
    }

    #[test]
    fn test_future_job_not_claimable() {
        let now = Utc::now();
        let job = Job::new(
            "RUN_DEBATE",
            json!({}),
            &EnqueueOptions::default().available_at(now + Duration::hours(1)),
            now,
        )
        .unwrap();
        assert!(!job.is_claimable(&[], now));
        assert!(job.is_claimable(&[], now + Duration::hours(2)));
    }

    #[test]
    fn test_type_filter() {
        let job = pending_job();
        let now = job.available_at;
        assert!(job.is_claimable(&["RUN_DEBATE".to_string()], now));
        assert!(!job.is_claimable(&["OTHER".to_string()], now));
    }

    #[test]
    fn test_claim_sets_lease_and_started_once() {
        let mut job = pending_job();
        let now = Utc::now();
        job.claim("w1", 1_000, now);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.lease_until, Some(now + Duration::seconds(1)));
        assert_eq!(job.started_at, Some(now));

        // Lease not expired yet.
        assert!(!job.is_claimable(&[], now));
        let later = now + Duration::seconds(5);
        assert!(job.is_claimable(&[], later));
        job.claim("w2", 1_000, later);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.started_at, Some(now));
        assert_eq!(job.worker_id.as_deref(), Some("w2"));
    }

    #[test]
    fn test_failure_schedules_backoff() {
        let mut job = pending_job();
        let now = Utc::now();
        job.claim("w1", 1_000, now);
        job.record_failure(
            &JobError::new("HANDLER_ERROR", "boom"),
            &FailOptions::retryable(500),
            now,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.available_at, now + Duration::milliseconds(500));
        assert!(job.lease_until.is_none());
        let failure = job.last_error.unwrap();
        assert_eq!(failure.retry_delay_ms, Some(500));
        assert!(!failure.terminal);
    }

    #[test]
    fn test_non_retryable_failure_is_terminal() {
        let mut job = pending_job();
        let now = Utc::now();
        job.claim("w1", 1_000, now);
        job.record_failure(
            &JobError::new("VALIDATION_ERROR", "bad payload"),
            &FailOptions::terminal(),
            now,
        )
        .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.last_error.as_ref().unwrap().terminal);
        assert!(!job.is_claimable(&[], now + Duration::days(1)));
    }

    #[test]
    fn test_complete_requires_running() {
        let mut job = pending_job();
        let err = job.complete(json!({}), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidState {
                status: JobStatus::Pending,
                ..
            }
        ));
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let job = pending_job();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "RUN_DEBATE");
        assert_eq!(value["status"], "pending");
        assert!(value.get("maxAttempts").is_some());
        assert!(value.get("leaseUntil").is_none());
    }
}
