//! `RUN_DEBATE` job handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::orchestrator::{DebateError, DebateOrchestrator};
use crate::queue::Job;
use crate::worker::{HandlerError, JobHandler};

pub const RUN_DEBATE: &str = "RUN_DEBATE";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunDebatePayload {
    debate_id: String,
}

/// Idempotency key for enqueueing a debate run.
pub fn run_debate_key(debate_id: &str) -> String {
    format!("{RUN_DEBATE}:{debate_id}")
}

pub struct DebateJobHandler {
    orchestrator: Arc<DebateOrchestrator>,
}

impl DebateJobHandler {
    pub fn new(orchestrator: Arc<DebateOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl From<DebateError> for HandlerError {
    fn from(e: DebateError) -> Self {
        if e.is_validation() {
            HandlerError::Validation {
                code: e.code().to_string(),
                message: e.to_string(),
            }
        } else {
            HandlerError::execution(e.code(), e.to_string())
        }
    }
}

#[async_trait]
impl JobHandler for DebateJobHandler {
    fn job_type(&self) -> &str {
        RUN_DEBATE
    }

    async fn handle(&self, job: &Job) -> Result<Value, HandlerError> {
        let payload: RunDebatePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| HandlerError::validation(format!("invalid RUN_DEBATE payload: {e}")))?;
        if payload.debate_id.trim().is_empty() {
            return Err(HandlerError::validation("debateId must not be empty"));
        }

        let outcome = self.orchestrator.run(&payload.debate_id).await?;
        Ok(json!({
            "debateId": outcome.debate_id,
            "status": outcome.status,
            "turns": outcome.turns,
            "rounds": outcome.rounds,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debate::knowledge::MemoryKnowledgeCatalog;
    use crate::debate::provider::{CompletionError, TurnCompletion, TurnRequest, TurnResponse};
    use crate::debate::state::Persona;
    use crate::debate::store::MemorySessionStore;
    use crate::queue::EnqueueOptions;
    use chrono::Utc;

    struct Unused;

    #[async_trait]
    impl TurnCompletion for Unused {
        fn name(&self) -> &str {
            "unused"
        }

        async fn complete_turn(
            &self,
            _persona: &Persona,
            _request: &TurnRequest,
        ) -> Result<TurnResponse, CompletionError> {
            Err(CompletionError::Empty)
        }
    }

    fn handler() -> DebateJobHandler {
        DebateJobHandler::new(Arc::new(DebateOrchestrator::new(
            Arc::new(MemorySessionStore::new()),
            Arc::new(Unused),
            Arc::new(MemoryKnowledgeCatalog::new()),
        )))
    }

    fn job(payload: Value) -> Job {
        Job::new(RUN_DEBATE, payload, &EnqueueOptions::default(), Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_bad_payloads_are_validation_errors() {
        let handler = handler();
        for payload in [json!({}), json!({"debateId": ""}), json!({"debateId": 7})] {
            let err = handler.handle(&job(payload)).await.unwrap_err();
            assert!(!err.is_retryable(), "{err}");
        }
    }

    #[tokio::test]
    async fn test_unknown_debate_is_not_retried() {
        let err = handler()
            .handle(&job(json!({"debateId": "ghost"})))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_idempotency_key() {
        assert_eq!(run_debate_key("d1"), "RUN_DEBATE:d1");
    }
}
