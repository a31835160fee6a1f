//! Worker loop: claims jobs and runs their handlers
//!
//! Each iteration claims at most one job, runs its [`JobHandler`] inside an
//! ambient [`RunContext`](crate::context::RunContext) and a `job` tracing
//! span, then records the outcome in three places:
//!
//! - the queue (`ack`, or `fail` with retry/backoff)
//! - the run ledger (run snapshot plus `RunStarted`/`RunFinished`/`Error`
//!   events)
//! - the [`RunNotifier`](crate::events::RunNotifier) broadcast
//!
//! A handler error or panic fails the job and the loop moves on. Only queue
//! or ledger failures outside a job stop the worker.

pub mod handler;
pub mod runner;

pub use handler::{HandlerError, HandlerRegistry, JobHandler};
pub use runner::{
    default_worker_id, IterationOutcome, Worker, WorkerOptions, DEFAULT_LEASE_MS,
    DEFAULT_POLL_INTERVAL,
};

use crate::ledger::LedgerError;
use crate::queue::QueueError;

/// Infrastructure failure that stops the worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl WorkerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Queue(e) => e.code(),
            Self::Ledger(e) => e.code(),
            Self::Task(_) => "WORKER_TASK_FAILED",
        }
    }
}
