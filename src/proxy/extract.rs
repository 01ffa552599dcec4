//! Best-effort field extraction from request and response JSON
//!
//! Every helper returns a zero value when a field is absent or has the wrong
//! type; parse failures never reach the caller.

use serde_json::Value;

/// Model name used when a request does not carry one
pub const UNKNOWN_MODEL: &str = "unknown";

/// Fields the proxy reads from a request body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFields {
    pub model: String,
    pub prompt: String,
}

impl Default for RequestFields {
    fn default() -> Self {
        Self {
            model: UNKNOWN_MODEL.to_string(),
            prompt: String::new(),
        }
    }
}

/// Read `model` and the prompt (`prompt`, else the last `messages[].content`)
pub fn request_fields(body: &[u8]) -> RequestFields {
    if body.is_empty() {
        return RequestFields::default();
    }
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return RequestFields::default();
    };

    let model = str_field(&value, "model")
        .filter(|m| !m.is_empty())
        .unwrap_or(UNKNOWN_MODEL)
        .to_string();

    let prompt = str_field(&value, "prompt")
        .or_else(|| {
            value
                .get("messages")
                .and_then(Value::as_array)
                .and_then(|messages| messages.last())
                .and_then(|last| str_field(last, "content"))
        })
        .unwrap_or_default()
        .to_string();

    RequestFields { model, prompt }
}

/// Endpoint label: the path without its leading `/` and `api/` prefix
pub fn endpoint_from_path(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    trimmed.strip_prefix("api/").unwrap_or(trimmed).to_string()
}

/// Generated text carried by one response object
///
/// `response` for generate-style bodies, `message.content` for chat.
pub fn response_text(value: &Value) -> Option<&str> {
    str_field(value, "response").or_else(|| {
        value
            .get("message")
            .and_then(|message| str_field(message, "content"))
    })
}

/// Whether this object is the terminal one of a stream
pub fn is_done(value: &Value) -> bool {
    value.get("done").and_then(Value::as_bool).unwrap_or(false)
}

/// Final counters reported by the backend; durations are nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalStats {
    pub eval_count: u64,
    pub eval_duration_ns: u64,
    pub prompt_eval_count: u64,
    pub load_duration_ns: u64,
    pub total_duration_ns: u64,
}

impl TerminalStats {
    pub fn from_value(value: &Value) -> Self {
        Self {
            eval_count: u64_field(value, "eval_count"),
            eval_duration_ns: u64_field(value, "eval_duration"),
            prompt_eval_count: u64_field(value, "prompt_eval_count"),
            load_duration_ns: u64_field(value, "load_duration"),
            total_duration_ns: u64_field(value, "total_duration"),
        }
    }

    /// Generated tokens per second of eval time; 0 without eval duration
    pub fn tokens_per_second(&self) -> f64 {
        if self.eval_count == 0 || self.eval_duration_ns == 0 {
            return 0.0;
        }
        self.eval_count as f64 / (self.eval_duration_ns as f64 / 1e9)
    }

    pub fn load_seconds(&self) -> f64 {
        self.load_duration_ns as f64 / 1e9
    }

    pub fn total_seconds(&self) -> f64 {
        self.total_duration_ns as f64 / 1e9
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn u64_field(value: &Value, key: &str) -> u64 {
    match value.get(key) {
        Some(v) => v
            .as_u64()
            .or_else(|| v.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        None => 0,
    }
}
