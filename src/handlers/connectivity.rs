//! `/test`: can the proxy reach the backend, and which models does it have

use axum::{Json, extract::State};
use serde::Serialize;
use serde_json::Value;

use crate::handlers::AppState;

/// Connectivity report; always served with 200
#[derive(Debug, Serialize, PartialEq)]
pub struct ConnectivityResponse {
    pub status: &'static str,
    pub ollama_host: String,
    pub ollama_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn handler(State(state): State<AppState>) -> Json<ConnectivityResponse> {
    let forwarder = state.pipeline().forwarder();
    let ollama_host = forwarder.base_url().to_string();

    match forwarder.list_models().await {
        Ok(tags) => {
            let models = model_names(&tags);
            tracing::debug!(model_count = models.len(), "Connectivity check succeeded");
            Json(ConnectivityResponse {
                status: "ok",
                ollama_host,
                ollama_reachable: true,
                models: Some(models),
                error: None,
            })
        }
        Err(e) => {
            tracing::warn!(error = %e, "Connectivity check failed");
            Json(ConnectivityResponse {
                status: "error",
                ollama_host,
                ollama_reachable: false,
                models: None,
                error: Some(e.to_string()),
            })
        }
    }
}

/// `models[].name` from a `/api/tags` body; malformed entries are skipped
fn model_names(tags: &Value) -> Vec<String> {
    tags.get("models")
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
