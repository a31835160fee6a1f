//! Ambient run context.
//!
//! The worker loop enters a [`RunContext`] scope for the duration of one job.
//! Anything running inside that scope (handlers, the debate orchestrator, the
//! event log) can read the current request/run identity without it being
//! threaded through every call.

use std::future::Future;

tokio::task_local! {
    static CURRENT: RunContext;
}

/// Identity of the unit of work currently executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub request_id: Option<String>,
    pub run_id: String,
    pub job_id: Option<String>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            request_id: None,
            run_id: run_id.into(),
            job_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Run `fut` with this context installed as the ambient one.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    /// The ambient context, if the caller is running inside a scope.
    pub fn current() -> Option<RunContext> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Ambient run id, if any.
    pub fn current_run_id() -> Option<String> {
        CURRENT.try_with(|ctx| ctx.run_id.clone()).ok()
    }

    /// Ambient request id, if any.
    pub fn current_request_id() -> Option<String> {
        CURRENT.try_with(|ctx| ctx.request_id.clone()).ok().flatten()
    }
}
