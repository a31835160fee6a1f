//! Ledger event records
//!
//! One record per line in the event log. Records are never modified once
//! written; their total order is the string order of `timestamp`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RunContext;

/// Kinds of ledger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    RunStarted,
    RunFinished,
    ToolInvoked,
    ToolFinished,
    LLMCallStarted,
    LLMCallFinished,
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "RunStarted",
            Self::RunFinished => "RunFinished",
            Self::ToolInvoked => "ToolInvoked",
            Self::ToolFinished => "ToolFinished",
            Self::LLMCallStarted => "LLMCallStarted",
            Self::LLMCallFinished => "LLMCallFinished",
            Self::Error => "Error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a ledger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One immutable ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// RFC 3339, UTC, millisecond precision (see [`format_timestamp`]).
    pub timestamp: String,
    pub level: EventLevel,
    pub event_type: EventType,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
    pub component: String,
    #[serde(default)]
    pub latency_ms: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl EventRecord {
    /// New event stamped now. `Error` events default to error level.
    pub fn new(event_type: EventType, component: impl Into<String>) -> Self {
        let level = match event_type {
            EventType::Error => EventLevel::Error,
            _ => EventLevel::Info,
        };
        Self {
            timestamp: format_timestamp(Utc::now()),
            level,
            event_type,
            request_id: None,
            run_id: None,
            component: component.into(),
            latency_ms: None,
            error: None,
            data: Value::Object(Default::default()),
        }
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    pub fn latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = format_timestamp(timestamp);
        self
    }

    /// Fill missing request/run ids from the ambient [`RunContext`].
    pub fn with_ambient_context(mut self) -> Self {
        if let Some(ctx) = RunContext::current() {
            if self.run_id.is_none() {
                self.run_id = Some(ctx.run_id);
            }
            if self.request_id.is_none() {
                self.request_id = ctx.request_id;
            }
        }
        self
    }

    /// Parsed timestamp, if well formed.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|ts| ts.with_timezone(&Utc))
    }

    /// String field from `data`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Canonical timestamp format: string order equals time order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}
