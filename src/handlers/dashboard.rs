//! Analytics dashboard page

use axum::{extract::State, response::Html};

use crate::handlers::AppState;

const FALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Ollama Proxy Analytics</title></head>
<body>
<h1>Ollama Proxy Analytics</h1>
<p>No dashboard file is installed. The JSON API is available:</p>
<ul>
<li><a href="/analytics/stats">/analytics/stats</a></li>
<li><a href="/analytics/stats/enhanced?hours=24">/analytics/stats/enhanced</a></li>
<li><a href="/analytics/messages">/analytics/messages</a></li>
<li><a href="/analytics/models">/analytics/models</a></li>
<li><a href="/analytics/search">/analytics/search</a></li>
<li><a href="/analytics/export?format=csv">/analytics/export</a></li>
<li><a href="/metrics">/metrics</a></li>
</ul>
</body>
</html>
"#;

/// Serve the configured dashboard file, or a built-in index of the API
pub async fn handler(State(state): State<AppState>) -> Html<String> {
    let path = &state.config().observability.dashboard_path;
    match tokio::fs::read_to_string(path).await {
        Ok(page) => Html(page),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Dashboard file unavailable, serving built-in page");
            Html(FALLBACK_PAGE.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handlers::test_state;

    #[tokio::test]
    async fn test_serves_configured_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dash.html");
        std::fs::write(&path, "<h1>custom</h1>").unwrap();

        let mut config = Config::default();
        config.observability.dashboard_path = path;
        let Html(page) = handler(State(test_state(config))).await;
        assert_eq!(page, "<h1>custom</h1>");
    }

    #[tokio::test]
    async fn test_missing_file_serves_fallback() {
        let mut config = Config::default();
        config.observability.dashboard_path = "/nonexistent/dashboard.html".into();
        let Html(page) = handler(State(test_state(config))).await;
        assert!(page.contains("/analytics/stats/enhanced"));
    }
}
