//! Per-request correlation state

use super::extract::TerminalStats;
use crate::analytics::record::{AnalyticsRecord, RecordStatus};
use crate::middleware::request_id::RequestId;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};

/// What the pipeline knows about one in-flight request
///
/// Built once the request body has been parsed; owned by the pipeline (or
/// by the streaming body's finalizer) until the observation is reported.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Option<RequestId>,
    pub started: Instant,
    pub received_at: DateTime<Utc>,
    pub model: String,
    pub prompt: String,
    pub endpoint: String,
    pub category: String,
    pub client_ip: String,
    pub user_agent: String,
}

impl RequestContext {
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Build the record for this request from its observed outcome
    pub fn to_record(&self, outcome: &Outcome) -> AnalyticsRecord {
        let error = outcome.error.clone().unwrap_or_default();
        let mut metadata = Map::new();
        metadata.insert("endpoint".to_string(), Value::from(self.endpoint.clone()));
        metadata.insert("streamed".to_string(), Value::from(outcome.streamed));
        if let Some(completed) = outcome.completed {
            metadata.insert("completed".to_string(), Value::from(completed));
        }
        if let Some(request_id) = self.request_id {
            metadata.insert("request_id".to_string(), Value::from(request_id.to_string()));
        }

        AnalyticsRecord {
            id: 0,
            timestamp: self.received_at,
            model: self.model.clone(),
            endpoint: self.endpoint.clone(),
            prompt: self.prompt.clone(),
            category: self.category.clone(),
            response: outcome.response_text.clone(),
            latency: outcome.duration.as_secs_f64(),
            load_duration: outcome.stats.load_seconds(),
            total_duration: outcome.stats.total_seconds(),
            time_to_first_token: outcome
                .time_to_first_token
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            input_tokens: outcome.stats.prompt_eval_count,
            output_tokens: outcome.stats.eval_count,
            tokens_per_second: outcome.stats.tokens_per_second(),
            status_code: outcome.status_code,
            status: RecordStatus::classify(outcome.status_code, outcome.error.as_deref()),
            error,
            client_ip: self.client_ip.clone(),
            user_agent: self.user_agent.clone(),
            metadata,
        }
        .truncated()
    }
}

/// Terminal observation of a request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub status_code: u16,
    pub duration: Duration,
    pub response_text: String,
    pub time_to_first_token: Option<Duration>,
    pub stats: TerminalStats,
    pub error: Option<String>,
    pub streamed: bool,
    /// Streams only: whether the terminal line arrived before the stream closed
    pub completed: Option<bool>,
}

impl Outcome {
    /// The backend could not be reached or did not answer in time
    pub fn transport_error(status_code: u16, duration: Duration, error: String) -> Self {
        Self {
            status_code,
            duration,
            error: Some(error),
            ..Default::default()
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_context() -> RequestContext {
    RequestContext {
        request_id: Some(RequestId::new()),
        started: Instant::now(),
        received_at: Utc::now(),
        model: "phi4".to_string(),
        prompt: "Summarize this article".to_string(),
        endpoint: "generate".to_string(),
        category: "summarize".to_string(),
        client_ip: "127.0.0.1".to_string(),
        user_agent: "test-agent".to_string(),
    }
}
