//! HTTP turn-completion providers.
//!
//! - [`ChatCompletionClient`]: OpenAI-compatible `chat/completions`
//! - [`AgentClient`]: delegated agent invocation, one POST per turn

use std::time::Duration;

use async_trait::async_trait;
use coordination::debate::{CompletionError, Persona, TurnCompletion, TurnRequest, TurnResponse};
use coordination::ledger::{usage_from_data, TokenUsage};
use serde_json::{json, Value};
use tracing::debug;

/// Rough words-to-tokens ratio used to cap response length.
const TOKENS_PER_WORD: u32 = 2;

fn build_client(timeout: Duration) -> Result<reqwest::Client, CompletionError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CompletionError::Request(format!("failed to build HTTP client: {e}")))
}

async fn post_json(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &Value,
) -> Result<Value, CompletionError> {
    let mut request = client.post(url).json(body);
    if let Some(key) = api_key {
        request = request.bearer_auth(key);
    }
    let response = request
        .send()
        .await
        .map_err(|e| CompletionError::Request(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        return Err(CompletionError::Status { status, body });
    }

    response
        .json()
        .await
        .map_err(|e| CompletionError::Parse(e.to_string()))
}

/// OpenAI-compatible chat completion client.
pub struct ChatCompletionClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    default_model: String,
}

impl ChatCompletionClient {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        default_model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            api_key,
            default_model: default_model.into(),
        })
    }

    pub fn request_body(&self, request: &TurnRequest) -> Value {
        let model = request.model.as_deref().unwrap_or(&self.default_model);
        json!({
            "model": model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_words.saturating_mul(TOKENS_PER_WORD),
        })
    }
}

/// Extract a turn from a `chat/completions` response body.
pub fn parse_chat_response(raw: Value, requested_model: &str) -> Result<TurnResponse, CompletionError> {
    let text = raw["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if text.is_empty() {
        return Err(CompletionError::Empty);
    }
    let model = raw["model"]
        .as_str()
        .unwrap_or(requested_model)
        .to_string();
    let usage = usage_from_data(&raw);
    Ok(TurnResponse {
        text,
        raw,
        model,
        usage,
    })
}

#[async_trait]
impl TurnCompletion for ChatCompletionClient {
    fn name(&self) -> &str {
        "chat-completion"
    }

    async fn complete_turn(
        &self,
        persona: &Persona,
        request: &TurnRequest,
    ) -> Result<TurnResponse, CompletionError> {
        let body = self.request_body(request);
        let model = body["model"].as_str().unwrap_or_default().to_string();
        debug!(persona = %persona.id, %model, "Requesting chat completion");
        let raw = post_json(&self.client, &self.url, self.api_key.as_deref(), &body).await?;
        parse_chat_response(raw, &model)
    }
}

/// Delegated agent client. The persona's `agentId` selects the agent.
pub struct AgentClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl AgentClient {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
            api_key,
        })
    }

    pub fn request_body(persona: &Persona, request: &TurnRequest) -> Result<Value, CompletionError> {
        let agent_id = persona.agent_id.as_deref().ok_or_else(|| {
            CompletionError::NotConfigured(format!("persona {} has no agentId", persona.id))
        })?;
        Ok(json!({
            "agentId": agent_id,
            "persona": {
                "id": persona.id,
                "name": persona.name,
                "role": persona.role,
                "stance": persona.stance,
            },
            "system": request.system,
            "input": request.prompt,
            "model": request.model,
            "maxWords": request.max_words,
        }))
    }
}

/// Extract a turn from an agent response: `{output|text, model?, usage?}`.
pub fn parse_agent_response(raw: Value, agent_id: &str) -> Result<TurnResponse, CompletionError> {
    let text = raw
        .get("output")
        .or_else(|| raw.get("text"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if text.is_empty() {
        return Err(CompletionError::Empty);
    }
    let model = raw
        .get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("agent:{agent_id}"));
    let usage: Option<TokenUsage> = usage_from_data(&raw);
    Ok(TurnResponse {
        text,
        raw,
        model,
        usage,
    })
}

#[async_trait]
impl TurnCompletion for AgentClient {
    fn name(&self) -> &str {
        "agent"
    }

    async fn complete_turn(
        &self,
        persona: &Persona,
        request: &TurnRequest,
    ) -> Result<TurnResponse, CompletionError> {
        let body = Self::request_body(persona, request)?;
        let agent_id = persona.agent_id.clone().unwrap_or_default();
        debug!(persona = %persona.id, %agent_id, "Invoking agent");
        let raw = post_json(&self.client, &self.url, self.api_key.as_deref(), &body).await?;
        parse_agent_response(raw, &agent_id)
    }
}
