use anyhow::{Context, Result};
use coordination::queue::DEFAULT_BACKOFF_BASE_MS;
use coordination::scheduler::Trigger;
use coordination::worker::{default_worker_id, WorkerOptions, DEFAULT_LEASE_MS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct CompletionEndpoint {
    /// Full URL of the `chat/completions` route.
    pub url: String,
    pub api_key: Option<String>,
    /// Used when neither the persona nor the debate names a model.
    pub model: String,
}

/// Delegated-agent invocation endpoint.
#[derive(Debug, Clone)]
pub struct AgentEndpoint {
    pub url: String,
    pub api_key: Option<String>,
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root of the queue, ledger and session files.
    pub data_dir: PathBuf,
    /// None = generated per process.
    pub worker_id: Option<String>,
    pub poll_ms: u64,
    pub lease_ms: u64,
    pub backoff_base_ms: u64,
    pub completion: CompletionEndpoint,
    /// Agent provider (optional; personas using it fail without one).
    pub agent: Option<AgentEndpoint>,
    /// JSON file of knowledge packs.
    pub knowledge_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub triggers: Vec<Trigger>,
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::var("COLLOQUY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            worker_id: std::env::var("COLLOQUY_WORKER_ID").ok(),
            poll_ms: env_u64("COLLOQUY_POLL_MS", 1_000),
            lease_ms: env_u64("COLLOQUY_LEASE_MS", DEFAULT_LEASE_MS),
            backoff_base_ms: env_u64("COLLOQUY_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
            completion: CompletionEndpoint {
                url: std::env::var("COLLOQUY_COMPLETION_URL")
                    .unwrap_or_else(|_| "http://localhost:8000/v1/chat/completions".into()),
                api_key: std::env::var("COLLOQUY_COMPLETION_API_KEY").ok(),
                model: std::env::var("COLLOQUY_COMPLETION_MODEL")
                    .unwrap_or_else(|_| "gpt-4o-mini".into()),
            },
            agent: Self::agent_from_env(),
            knowledge_path: std::env::var("COLLOQUY_KNOWLEDGE_PATH").ok().map(PathBuf::from),
            http_timeout_secs: env_u64("COLLOQUY_HTTP_TIMEOUT_SECS", 120),
            triggers: Vec::new(),
        }
    }
}

impl WorkerConfig {
    fn agent_from_env() -> Option<AgentEndpoint> {
        let url = std::env::var("COLLOQUY_AGENT_URL").ok()?;
        Some(AgentEndpoint {
            url,
            api_key: std::env::var("COLLOQUY_AGENT_API_KEY").ok(),
        })
    }

    /// Environment defaults, overridden by the TOML file if given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            config.apply(FileConfig::from_file(path)?);
        }
        Ok(config)
    }

    /// Overlay every value the file sets.
    pub fn apply(&mut self, file: FileConfig) {
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.worker_id {
            self.worker_id = Some(v);
        }
        if let Some(v) = file.poll_ms {
            self.poll_ms = v;
        }
        if let Some(v) = file.lease_ms {
            self.lease_ms = v;
        }
        if let Some(v) = file.backoff_base_ms {
            self.backoff_base_ms = v;
        }
        if let Some(v) = file.completion_url {
            self.completion.url = v;
        }
        if let Some(v) = file.completion_api_key {
            self.completion.api_key = Some(v);
        }
        if let Some(v) = file.completion_model {
            self.completion.model = v;
        }
        if let Some(url) = file.agent_url {
            let api_key = self.agent.take().and_then(|a| a.api_key);
            self.agent = Some(AgentEndpoint { url, api_key });
        }
        if let Some(v) = file.knowledge_path {
            self.knowledge_path = Some(v);
        }
        if let Some(v) = file.http_timeout_secs {
            self.http_timeout_secs = v;
        }
        self.triggers.extend(file.triggers);
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            worker_id: self.worker_id.clone().unwrap_or_else(default_worker_id),
            poll_interval: Duration::from_millis(self.poll_ms),
            lease_ms: self.lease_ms,
            backoff_base_ms: self.backoff_base_ms,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// TOML overrides. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub worker_id: Option<String>,
    pub poll_ms: Option<u64>,
    pub lease_ms: Option<u64>,
    pub backoff_base_ms: Option<u64>,
    pub completion_url: Option<String>,
    pub completion_api_key: Option<String>,
    pub completion_model: Option<String>,
    pub agent_url: Option<String>,
    pub knowledge_path: Option<PathBuf>,
    pub http_timeout_secs: Option<u64>,
    pub triggers: Vec<Trigger>,
}

impl FileConfig {
    /// Load overrides from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
        let config: FileConfig =
            toml::from_str(&content).context("Failed to parse worker config TOML")?;
        Ok(config)
    }
}
