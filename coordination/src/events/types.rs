//! Run notifications published by the worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a job run, as seen by downstream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunNotification {
    /// The job was acked.
    Completed {
        run_id: String,
        job_id: String,
        job_type: String,
        result: Value,
        timestamp: DateTime<Utc>,
    },

    /// A job attempt failed. `terminal` is false when a retry is scheduled.
    Failed {
        run_id: String,
        job_id: String,
        job_type: String,
        code: String,
        message: String,
        terminal: bool,
        timestamp: DateTime<Utc>,
    },
}

impl RunNotification {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Completed { run_id, .. } | Self::Failed { run_id, .. } => run_id,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed { job_id, .. } | Self::Failed { job_id, .. } => job_id,
        }
    }

    pub fn job_type(&self) -> &str {
        match self {
            Self::Completed { job_type, .. } | Self::Failed { job_type, .. } => job_type,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Completed { timestamp, .. } | Self::Failed { timestamp, .. } => *timestamp,
        }
    }
}
