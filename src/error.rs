//! Error types for the proxy
//!
//! All errors implement `IntoResponse` for Axum handlers. Startup variants are
//! fatal when they occur in `main`; everything reachable from a request maps to
//! a client-visible status instead of taking the process down.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read config file '{path}': {source}")]
    ConfigFileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {source}")]
    ConfigParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration in '{path}': {reason}")]
    ConfigValidationFailed { path: String, reason: String },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Request body exceeds {limit_bytes} bytes")]
    PayloadTooLarge { limit_bytes: usize },

    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("Request cancelled while waiting for a free slot")]
    AdmissionCancelled,

    #[error("Proxy error: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Backend did not respond within {timeout_seconds} seconds")]
    BackendTimeout { timeout_seconds: u64 },

    #[error("Analytics not available: {0}")]
    AnalyticsUnavailable(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Port {port} is already in use")]
    PortInUse { port: u16 },

    #[error("Failed to launch backend '{executable}': {reason}")]
    BackendLaunch { executable: String, reason: String },

    #[error("Backend on port {port} did not become ready within {timeout_seconds} seconds")]
    BackendNotReady { port: u16, timeout_seconds: u64 },

    #[error("Failed to bind listener on {addr}: {source}")]
    ListenerBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status used when this error reaches a client
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::RequestBody(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::AdmissionCancelled => StatusCode::REQUEST_TIMEOUT,
            Self::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::AnalyticsUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_)
            | Self::ConfigFileRead { .. }
            | Self::ConfigParseFailed { .. }
            | Self::ConfigValidationFailed { .. }
            | Self::Storage(_)
            | Self::PortInUse { .. }
            | Self::BackendLaunch { .. }
            | Self::BackendNotReady { .. }
            | Self::ListenerBind { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": self.to_string(),
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_creates() {
        let err = AppError::Config("test error".to_string());
        assert_eq!(err.to_string(), "Configuration error: test error");
    }

    #[test]
    fn test_backend_unavailable_is_bad_gateway() {
        let err = AppError::BackendUnavailable {
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "Proxy error: connection refused");
        assert_eq!(err.into_response().status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_request_body_read_failure_is_bad_request() {
        let err = AppError::RequestBody("connection reset".to_string());
        assert_eq!(err.to_string(), "Failed to read request body: connection reset");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_backend_timeout_is_gateway_timeout() {
        let err = AppError::BackendTimeout { timeout_seconds: 60 };
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_admission_cancelled_is_request_timeout() {
        let response = AppError::AdmissionCancelled.into_response();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn test_analytics_unavailable_is_service_unavailable() {
        let response = AppError::AnalyticsUnavailable("disabled".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_not_found_message() {
        let err = AppError::NotFound("Message 42".to_string());
        assert_eq!(err.to_string(), "Message 42 not found");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_startup_errors_are_internal() {
        let err = AppError::PortInUse { port: 11434 };
        assert_eq!(err.to_string(), "Port 11434 is already in use");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let err = AppError::BackendNotReady {
            port: 11435,
            timeout_seconds: 30,
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_rusqlite_error_maps_to_storage() {
        let err: AppError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, AppError::Storage(_)));
    }

    #[tokio::test]
    async fn test_error_body_is_json() {
        let response = AppError::Validation("bad".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Invalid request: bad");
    }
}
