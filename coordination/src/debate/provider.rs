//! Turn-completion capability.
//!
//! A persona's turn is produced either by a direct model completion or by a
//! delegated agent, selected by [`Persona::provider`]. [`ProviderRouter`]
//! dispatches between the two.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::state::{Persona, ProviderKind};
use crate::ledger::TokenUsage;

/// Errors from a turn-completion provider.
#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Provider returned an empty response")]
    Empty,

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl CompletionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Request(_) => "PROVIDER_REQUEST_FAILED",
            Self::Status { .. } => "PROVIDER_HTTP_ERROR",
            Self::Parse(_) => "PROVIDER_BAD_RESPONSE",
            Self::Empty => "PROVIDER_EMPTY_RESPONSE",
            Self::NotConfigured(_) => "PROVIDER_NOT_CONFIGURED",
        }
    }
}

/// Input to one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub system: String,
    pub prompt: String,
    /// Resolved model (persona override, else session default).
    pub model: Option<String>,
    pub temperature: f32,
    pub max_words: u32,
}

/// Output of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnResponse {
    pub text: String,
    /// Provider response body as received.
    pub raw: Value,
    pub model: String,
    pub usage: Option<TokenUsage>,
}

#[async_trait]
pub trait TurnCompletion: Send + Sync {
    /// Provider name for logs and ledger events.
    fn name(&self) -> &str;

    async fn complete_turn(
        &self,
        persona: &Persona,
        request: &TurnRequest,
    ) -> Result<TurnResponse, CompletionError>;
}

/// Dispatches on the persona's [`ProviderKind`].
pub struct ProviderRouter {
    direct: Arc<dyn TurnCompletion>,
    agent: Option<Arc<dyn TurnCompletion>>,
}

impl ProviderRouter {
    pub fn new(direct: Arc<dyn TurnCompletion>) -> Self {
        Self {
            direct,
            agent: None,
        }
    }

    pub fn with_agent(mut self, agent: Arc<dyn TurnCompletion>) -> Self {
        self.agent = Some(agent);
        self
    }

    fn route(&self, kind: ProviderKind) -> Result<&Arc<dyn TurnCompletion>, CompletionError> {
        match kind {
            ProviderKind::Direct => Ok(&self.direct),
            ProviderKind::Agent => self
                .agent
                .as_ref()
                .ok_or_else(|| CompletionError::NotConfigured("agent provider".into())),
        }
    }
}

#[async_trait]
impl TurnCompletion for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    async fn complete_turn(
        &self,
        persona: &Persona,
        request: &TurnRequest,
    ) -> Result<TurnResponse, CompletionError> {
        self.route(persona.provider)?
            .complete_turn(persona, request)
            .await
    }
}
