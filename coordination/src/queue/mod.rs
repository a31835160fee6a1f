//! Durable job queue with lease-based claiming
//!
//! This module provides the work queue the worker loop polls:
//! - Idempotent enqueue keyed by a caller-supplied idempotency key
//! - Lease-based claiming, with reclaim of expired leases from crashed workers
//! - Exponential-backoff retry up to a per-job attempt budget
//!
//! # Architecture
//!
//! Both stores implement [`JobQueue`] and share the record logic in
//! [`Job`], so the lease and backoff contract is identical:
//!
//! - [`FileJobQueue`]: one JSON document per job under `jobs/`, claims
//!   serialized per job by an exclusive lock file
//! - [`MemoryJobQueue`]: a mutex-guarded map, for tests and embedding
//!
//! ```text
//! enqueue ──▶ pending ──dequeue──▶ running ──ack──▶ completed
//!               ▲                    │
//!               └──fail (retry)──────┤
//!                                    └──fail (exhausted)──▶ failed
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use coordination::queue::{DequeueOptions, EnqueueOptions, FileJobQueue, JobQueue};
//!
//! let queue = FileJobQueue::open("./data")?;
//! let outcome = queue.enqueue(
//!     "RUN_DEBATE",
//!     serde_json::json!({ "debateId": "d1" }),
//!     EnqueueOptions::default().idempotency_key("RUN_DEBATE:d1"),
//! )?;
//!
//! let job = queue.dequeue(&DequeueOptions {
//!     worker_id: "worker-1".into(),
//!     job_types: vec!["RUN_DEBATE".into()],
//!     lease_ms: 60_000,
//! })?;
//! ```

pub mod file;
pub mod memory;
pub mod retry;
pub mod types;

use std::sync::Arc;

use serde_json::Value;

pub use file::FileJobQueue;
pub use memory::MemoryJobQueue;
pub use retry::{backoff_delay_ms, DEFAULT_BACKOFF_BASE_MS};
pub use types::{
    DequeueOptions, EnqueueOptions, EnqueueOutcome, FailOptions, Job, JobError, JobFailure,
    JobFilter, JobId, JobStatus, DEFAULT_MAX_ATTEMPTS,
};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        expected: JobStatus,
    },

    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Timed out waiting for lock on job {0}")]
    LockTimeout(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl QueueError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "QUEUE_IO",
            Self::NotFound(_) => "JOB_NOT_FOUND",
            Self::InvalidState { .. } => "JOB_INVALID_STATE",
            Self::Invalid(_) => "VALIDATION_ERROR",
            Self::LockTimeout(_) => "JOB_LOCK_TIMEOUT",
            Self::LockPoisoned => "QUEUE_LOCK_POISONED",
        }
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Shared reference to a queue implementation
pub type SharedJobQueue = Arc<dyn JobQueue>;

/// Storage interface for the job queue.
///
/// Implementations must make the claim in [`dequeue`](Self::dequeue) atomic:
/// two racing dequeuers never both receive the same job for the same lease.
///
/// Idempotency dedup in [`enqueue`](Self::enqueue) is a best-effort scan,
/// not a uniqueness constraint: two producers racing on one key can both
/// create a job.
pub trait JobQueue: Send + Sync {
    /// Persist a new pending job, or return the existing job carrying the same
    /// idempotency key if it is pending, running or completed.
    fn enqueue(
        &self,
        job_type: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> QueueResult<EnqueueOutcome>;

    /// Claim the next eligible job, if any.
    fn dequeue(&self, opts: &DequeueOptions) -> QueueResult<Option<Job>>;

    /// Mark a running job completed with `result`.
    fn ack(&self, job_id: &str, result: Value) -> QueueResult<Job>;

    /// Record a failure: reschedule with backoff, or fail terminally.
    fn fail(&self, job_id: &str, error: &JobError, opts: &FailOptions) -> QueueResult<Job>;

    /// Read one job.
    fn get(&self, job_id: &str) -> QueueResult<Option<Job>>;

    /// List jobs matching `filter`, newest first.
    fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>>;
}
