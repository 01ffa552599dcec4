//! The persisted analytics record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Maximum stored prompt length, in characters
pub const PROMPT_MAX_CHARS: usize = 1000;

/// Maximum stored response preview length, in characters
pub const RESPONSE_PREVIEW_MAX_CHARS: usize = 200;

/// Outcome tag of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Error,
}

impl RecordStatus {
    /// `error` for HTTP status >= 400 or any transport/stream error
    pub fn classify(status_code: u16, error: Option<&str>) -> Self {
        if status_code >= 400 || error.is_some_and(|e| !e.is_empty()) {
            RecordStatus::Error
        } else {
            RecordStatus::Success
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Success => "success",
            RecordStatus::Error => "error",
        }
    }

    pub(crate) fn from_db(value: &str) -> Self {
        match value {
            "error" => RecordStatus::Error,
            _ => RecordStatus::Success,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed request
///
/// Built once when the response (or terminal error) has been observed and
/// never modified after it is queued. `id` is assigned by the store; records
/// that have not been persisted carry `0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub id: i64,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub endpoint: String,
    pub prompt: String,
    pub category: String,
    pub response: String,
    /// Wall-clock duration seen by the proxy, in seconds
    pub latency: f64,
    pub load_duration: f64,
    pub total_duration: f64,
    pub time_to_first_token: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_per_second: f64,
    pub status_code: u16,
    pub status: RecordStatus,
    pub error: String,
    pub client_ip: String,
    pub user_agent: String,
    pub metadata: Map<String, Value>,
}

impl AnalyticsRecord {
    /// Apply the storage length limits to prompt and response preview
    pub fn truncated(mut self) -> Self {
        self.prompt = truncate_chars(&self.prompt, PROMPT_MAX_CHARS);
        self.response = truncate_chars(&self.response, RESPONSE_PREVIEW_MAX_CHARS);
        self
    }
}

/// Truncate to at most `max_chars` characters without splitting a code point
pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
pub(crate) fn sample_record() -> AnalyticsRecord {
    let mut metadata = Map::new();
    metadata.insert("endpoint".to_string(), Value::from("generate"));
    AnalyticsRecord {
        id: 0,
        timestamp: Utc::now(),
        model: "phi4".to_string(),
        endpoint: "generate".to_string(),
        prompt: "Summarize this article".to_string(),
        category: "summarize".to_string(),
        response: "Hi".to_string(),
        latency: 1.5,
        load_duration: 0.1,
        total_duration: 1.4,
        time_to_first_token: 0.2,
        input_tokens: 5,
        output_tokens: 10,
        tokens_per_second: 10.0,
        status_code: 200,
        status: RecordStatus::Success,
        error: String::new(),
        client_ip: "127.0.0.1".to_string(),
        user_agent: "curl/8.0".to_string(),
        metadata,
    }
}
