//! Run summaries derived from the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{EventRecord, EventType};
use super::pricing::estimate_cost_usd;
use super::runs::{RunStatus, TokenUsage};
use crate::queue::{Job, JobStatus};

/// Where a summary was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    Events,
    Queue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub request_id: Option<String>,
    pub kind: Option<String>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub tokens: TokenUsage,
    pub estimated_cost_usd: f64,
    pub error: Option<String>,
    pub event_count: usize,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub source: SummarySource,
    pub job_id: Option<String>,
}

/// Token usage carried by an `LLMCallFinished` event (`data.usage`).
///
/// `total_tokens` is optional; when absent it is prompt + completion.
pub fn usage_from_data(data: &Value) -> Option<TokenUsage> {
    let usage = data.get("usage")?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = usage
        .get("total_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(prompt + completion);
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

/// Summarize one run from its events. Events for other runs are ignored.
pub fn summarize_run_events(run_id: &str, events: &[EventRecord]) -> RunSummary {
    let mut summary = RunSummary {
        run_id: run_id.to_string(),
        request_id: None,
        kind: None,
        status: RunStatus::Running,
        started_at: None,
        finished_at: None,
        duration_ms: None,
        tokens: TokenUsage::default(),
        estimated_cost_usd: 0.0,
        error: None,
        event_count: 0,
        last_activity_at: None,
        source: SummarySource::Events,
        job_id: None,
    };
    let mut finished_status: Option<RunStatus> = None;
    let mut saw_error = false;

    for event in events
        .iter()
        .filter(|e| e.run_id.as_deref() == Some(run_id))
    {
        summary.event_count += 1;
        let ts = event.parsed_timestamp();
        if ts > summary.last_activity_at {
            summary.last_activity_at = ts;
        }
        if summary.request_id.is_none() {
            summary.request_id = event.request_id.clone();
        }

        match event.event_type {
            EventType::RunStarted => {
                // A new attempt: the outcome of the previous one no longer applies.
                finished_status = None;
                saw_error = false;
                summary.error = None;
                summary.finished_at = None;
                if summary.started_at.is_none() {
                    summary.started_at = ts;
                }
                if summary.kind.is_none() {
                    summary.kind = event
                        .data_str("kind")
                        .or_else(|| event.data_str("jobType"))
                        .map(str::to_string);
                }
                if summary.job_id.is_none() {
                    summary.job_id = event.data_str("jobId").map(str::to_string);
                }
            }
            EventType::RunFinished => {
                summary.finished_at = ts;
                finished_status = Some(
                    event
                        .data_str("status")
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(RunStatus::Completed),
                );
                if let Some(err) = &event.error {
                    summary.error = Some(err.clone());
                }
            }
            EventType::LLMCallFinished => {
                if let Some(usage) = usage_from_data(&event.data) {
                    let model = event.data_str("model").unwrap_or_default();
                    summary.estimated_cost_usd +=
                        estimate_cost_usd(model, usage.prompt_tokens, usage.completion_tokens);
                    summary.tokens.add(usage);
                }
            }
            EventType::Error => {
                saw_error = true;
                if let Some(err) = &event.error {
                    summary.error = Some(err.clone());
                }
            }
            EventType::ToolInvoked | EventType::ToolFinished | EventType::LLMCallStarted => {}
        }
    }

    summary.status = match finished_status {
        Some(status) => status,
        None if saw_error => RunStatus::Failed,
        None => RunStatus::Running,
    };
    if let (Some(start), Some(end)) = (summary.started_at, summary.finished_at) {
        summary.duration_ms = Some((end - start).num_milliseconds().max(0) as u64);
    }
    summary
}

/// Pseudo-summary for a job that has not produced any event yet.
pub fn summarize_job(job: &Job) -> RunSummary {
    let status = match job.status {
        JobStatus::Pending => RunStatus::Queued,
        JobStatus::Running => RunStatus::Running,
        JobStatus::Completed => RunStatus::Completed,
        JobStatus::Failed => RunStatus::Failed,
    };
    RunSummary {
        run_id: job.run_id.clone(),
        request_id: None,
        kind: Some(job.job_type.clone()),
        status,
        started_at: job.started_at,
        finished_at: job.finished_at,
        duration_ms: None,
        tokens: TokenUsage::default(),
        estimated_cost_usd: 0.0,
        error: job.last_error.as_ref().map(|e| e.code.clone()),
        event_count: 0,
        last_activity_at: Some(job.updated_at),
        source: SummarySource::Queue,
        job_id: Some(job.id.clone()),
    }
}
