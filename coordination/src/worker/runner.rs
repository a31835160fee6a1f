//! The worker loop.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::handler::{HandlerError, HandlerRegistry};
use super::WorkerError;
use crate::context::RunContext;
use crate::events::{RunNotification, SharedRunNotifier};
use crate::ledger::{summarize_run_events, EventQuery, EventRecord, EventType, Ledger, RunPatch, RunStatus};
use crate::queue::{
    DequeueOptions, FailOptions, Job, JobError, JobQueue, JobStatus, QueueError, QueueResult,
    SharedJobQueue, DEFAULT_BACKOFF_BASE_MS,
};

const COMPONENT: &str = "worker";

/// Default lease: 10 minutes.
pub const DEFAULT_LEASE_MS: u64 = 10 * 60 * 1_000;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_000);

/// `worker-<host or pid>-<short uuid>`.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| std::process::id().to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{host}-{}", &suffix[..8])
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub lease_ms: u64,
    pub backoff_base_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            lease_ms: DEFAULT_LEASE_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
        }
    }
}

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    /// No eligible job.
    Idle,
    Completed {
        job_id: String,
        run_id: String,
    },
    /// The attempt failed and the job is pending again.
    RetryScheduled {
        job_id: String,
        run_id: String,
        retry_at: DateTime<Utc>,
    },
    /// The job failed terminally.
    Failed {
        job_id: String,
        run_id: String,
        code: String,
    },
    /// The job changed state under us (reclaimed elsewhere) before we could
    /// record the outcome.
    Lost {
        job_id: String,
    },
}

/// Polls the queue and runs one job at a time.
pub struct Worker {
    queue: SharedJobQueue,
    ledger: Ledger,
    handlers: HandlerRegistry,
    notifier: SharedRunNotifier,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        queue: SharedJobQueue,
        ledger: Ledger,
        handlers: HandlerRegistry,
        notifier: SharedRunNotifier,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue,
            ledger,
            handlers,
            notifier,
            options,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.options.worker_id
    }

    /// Loop until `cancel` fires or infrastructure fails.
    ///
    /// Cancellation is observed between jobs; a running job is finished first.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        info!(
            worker_id = %self.options.worker_id,
            job_types = ?self.handlers.job_types(),
            "Worker started"
        );
        while !cancel.is_cancelled() {
            match self.run_once().await? {
                IterationOutcome::Idle => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                    }
                }
                outcome => debug!(?outcome, "Iteration finished"),
            }
        }
        info!(worker_id = %self.options.worker_id, "Worker stopped");
        Ok(())
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self) -> Result<IterationOutcome, WorkerError> {
        let claimed = self.queue.dequeue(&DequeueOptions {
            worker_id: self.options.worker_id.clone(),
            job_types: self.handlers.job_types(),
            lease_ms: self.options.lease_ms,
        })?;
        let Some(job) = claimed else {
            return Ok(IterationOutcome::Idle);
        };

        let mut ctx = RunContext::new(&job.run_id).with_job_id(&job.id);
        if let Some(request_id) = job.payload.get("requestId").and_then(Value::as_str) {
            ctx = ctx.with_request_id(request_id);
        }
        let span = info_span!(
            "job",
            job_id = %job.id,
            run_id = %job.run_id,
            job_type = %job.job_type,
            attempt = job.attempts,
        );
        ctx.scope(self.process(job).instrument(span)).await
    }

    async fn process(&self, job: Job) -> Result<IterationOutcome, WorkerError> {
        info!(max_attempts = job.max_attempts, "Job claimed");
        let started_at = job.started_at.unwrap_or_else(Utc::now);

        self.ledger.runs.upsert(
            RunPatch::new(&job.run_id)
                .kind(&job.job_type)
                .status(RunStatus::Running)
                .request_id(RunContext::current_request_id())
                .started_at(started_at)
                .clear_outcome()
                .metadata(self.run_metadata(&job, None)),
        )?;
        self.ledger.events.append_event(
            EventRecord::new(EventType::RunStarted, COMPONENT).data(json!({
                "jobId": job.id,
                "jobType": job.job_type,
                "kind": job.job_type,
                "attempt": job.attempts,
                "workerId": self.options.worker_id,
            })),
        )?;

        match self.execute(&job).await {
            Ok(result) => self.succeed(&job, started_at, result).await,
            Err(err) => self.fail(&job, started_at, err).await,
        }
    }

    /// Run a queue call on the blocking pool. File-backed `ack`/`fail` may
    /// wait on another process's job lock.
    async fn on_queue<T, F>(&self, op: F) -> Result<QueueResult<T>, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn JobQueue) -> QueueResult<T> + Send + 'static,
    {
        let queue = self.queue.clone();
        Ok(tokio::task::spawn_blocking(move || op(queue.as_ref())).await?)
    }

    /// Run the handler in its own task so a panic is contained.
    async fn execute(&self, job: &Job) -> Result<Value, HandlerError> {
        let Some(handler) = self.handlers.get(&job.job_type) else {
            return Err(HandlerError::Validation {
                code: "NO_HANDLER".into(),
                message: format!("no handler registered for job type '{}'", job.job_type),
            });
        };

        let owned = job.clone();
        let task = async move { handler.handle(&owned).await };
        let span = Span::current();
        let handle = match RunContext::current() {
            Some(ctx) => tokio::spawn(ctx.scope(task).instrument(span)),
            None => tokio::spawn(task.instrument(span)),
        };

        match handle.await {
            Ok(result) => result,
            Err(join) if join.is_panic() => {
                let payload = join.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!(%message, "Handler panicked");
                Err(HandlerError::execution("HANDLER_PANIC", message))
            }
            Err(join) => Err(HandlerError::execution("HANDLER_CANCELLED", join.to_string())),
        }
    }

    async fn succeed(
        &self,
        job: &Job,
        started_at: DateTime<Utc>,
        result: Value,
    ) -> Result<IterationOutcome, WorkerError> {
        let (job_id, acked) = (job.id.clone(), result.clone());
        match self.on_queue(move |queue| queue.ack(&job_id, acked)).await? {
            Ok(_) => {}
            Err(e @ (QueueError::InvalidState { .. } | QueueError::NotFound(_))) => {
                warn!(error = %e, "Job no longer ours, dropping result");
                return Ok(IterationOutcome::Lost {
                    job_id: job.id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        let finished_at = Utc::now();
        let mut patch = RunPatch::new(&job.run_id)
            .status(RunStatus::Completed)
            .clear_error()
            .finished_at(finished_at)
            .duration_ms(elapsed_ms(started_at, finished_at))
            .metadata(self.run_metadata(job, Some(&result)));
        if let Some(summary) = self.usage_summary(&job.run_id) {
            patch = patch.tokens(summary.tokens, summary.estimated_cost_usd);
        }
        self.ledger.runs.upsert(patch)?;

        self.ledger.events.append_event(
            EventRecord::new(EventType::RunFinished, COMPONENT)
                .latency_ms(elapsed_ms(started_at, finished_at))
                .data(json!({ "status": "completed", "jobId": job.id })),
        )?;
        self.notifier.publish(RunNotification::Completed {
            run_id: job.run_id.clone(),
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            result,
            timestamp: finished_at,
        });

        info!("Job completed");
        Ok(IterationOutcome::Completed {
            job_id: job.id.clone(),
            run_id: job.run_id.clone(),
        })
    }

    async fn fail(
        &self,
        job: &Job,
        started_at: DateTime<Utc>,
        err: HandlerError,
    ) -> Result<IterationOutcome, WorkerError> {
        let job_error = JobError::new(err.code(), err.message());
        let opts = if err.is_retryable() {
            FailOptions::retryable(self.options.backoff_base_ms)
        } else {
            FailOptions::terminal()
        };

        let job_id = job.id.clone();
        let recorded = self
            .on_queue(move |queue| queue.fail(&job_id, &job_error, &opts))
            .await?;
        let failed = match recorded {
            Ok(job) => job,
            Err(e @ (QueueError::InvalidState { .. } | QueueError::NotFound(_))) => {
                warn!(error = %e, handler_error = %err, "Job no longer ours, dropping failure");
                return Ok(IterationOutcome::Lost {
                    job_id: job.id.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let terminal = failed.status == JobStatus::Failed;

        let finished_at = Utc::now();
        let mut patch = RunPatch::new(&job.run_id)
            .status(RunStatus::Failed)
            .finished_at(finished_at)
            .duration_ms(elapsed_ms(started_at, finished_at))
            .error(format!("{}: {}", err.code(), err.message()));
        if let Some(summary) = self.usage_summary(&job.run_id) {
            patch = patch.tokens(summary.tokens, summary.estimated_cost_usd);
        }
        self.ledger.runs.upsert(patch)?;

        self.ledger.events.append_event(
            EventRecord::new(EventType::Error, COMPONENT)
                .error(err.message())
                .data(json!({
                    "code": err.code(),
                    "jobId": job.id,
                    "attempt": job.attempts,
                    "retryable": err.is_retryable(),
                    "terminal": terminal,
                })),
        )?;
        self.ledger.events.append_event(
            EventRecord::new(EventType::RunFinished, COMPONENT)
                .latency_ms(elapsed_ms(started_at, finished_at))
                .error(err.message())
                .data(json!({ "status": "failed", "jobId": job.id, "terminal": terminal })),
        )?;
        self.notifier.publish(RunNotification::Failed {
            run_id: job.run_id.clone(),
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            code: err.code().to_string(),
            message: err.message().to_string(),
            terminal,
            timestamp: finished_at,
        });

        if terminal {
            warn!(code = err.code(), error = %err.message(), "Job failed terminally");
            Ok(IterationOutcome::Failed {
                job_id: job.id.clone(),
                run_id: job.run_id.clone(),
                code: err.code().to_string(),
            })
        } else {
            warn!(
                code = err.code(),
                error = %err.message(),
                retry_at = %failed.available_at,
                "Job attempt failed, retry scheduled"
            );
            Ok(IterationOutcome::RetryScheduled {
                job_id: job.id.clone(),
                run_id: job.run_id.clone(),
                retry_at: failed.available_at,
            })
        }
    }

    fn run_metadata(&self, job: &Job, result: Option<&Value>) -> Map<String, Value> {
        let mut metadata = Map::new();
        metadata.insert("jobId".into(), json!(job.id));
        metadata.insert("attempt".into(), json!(job.attempts));
        metadata.insert("workerId".into(), json!(self.options.worker_id));
        if let Some(result) = result {
            metadata.insert("result".into(), result.clone());
        }
        metadata
    }

    /// Token and cost totals from the run's events. Best effort.
    fn usage_summary(&self, run_id: &str) -> Option<crate::ledger::RunSummary> {
        match self.ledger.events.list_events(&EventQuery::for_run(run_id)) {
            Ok(events) => Some(summarize_run_events(run_id, &events)),
            Err(e) => {
                warn!(error = %e, "Could not read run events for usage totals");
                None
            }
        }
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}
