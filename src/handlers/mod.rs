//! HTTP handlers and the router that ties them together

use crate::analytics::Analytics;
use crate::categorizer::PromptCategorizer;
use crate::config::Config;
use crate::error::AppResult;
use crate::metrics::Metrics;
use crate::middleware::request_id_middleware;
use crate::proxy::Pipeline;
use axum::{Router, middleware, routing::get};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub mod analytics;
pub mod connectivity;
pub mod dashboard;
pub mod metrics;
pub mod proxy;

/// Application state shared across all handlers
///
/// All fields are Arc'd for cheap cloning across Axum handlers.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    analytics: Arc<Analytics>,
    pipeline: Arc<Pipeline>,
}

impl AppState {
    /// Build the shared state
    ///
    /// `shutdown` is cancelled when the process starts shutting down; requests
    /// still queued for admission are then rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend HTTP client cannot be created.
    pub fn new(
        config: Arc<Config>,
        metrics: Arc<Metrics>,
        analytics: Arc<Analytics>,
        shutdown: CancellationToken,
    ) -> AppResult<Self> {
        let categorizer = Arc::new(PromptCategorizer::new());
        let pipeline = Arc::new(Pipeline::new(
            &config,
            categorizer,
            metrics.clone(),
            analytics.clone(),
            shutdown,
        )?);

        Ok(Self {
            config,
            metrics,
            analytics,
            pipeline,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn analytics(&self) -> &Arc<Analytics> {
        &self.analytics
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

/// The full HTTP surface: proxy endpoints first, everything else forwarded
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics::handler))
        .route("/test", get(connectivity::handler))
        .route("/analytics", get(dashboard::handler))
        .route("/analytics/stats", get(analytics::stats))
        .route("/analytics/stats/enhanced", get(analytics::enhanced_stats))
        .route("/analytics/messages", get(analytics::messages))
        .route("/analytics/messages/{id}", get(analytics::message))
        .route("/analytics/models", get(analytics::models))
        .route("/analytics/search", get(analytics::search))
        .route("/analytics/export", get(analytics::export))
        .route("/analytics/{*path}", get(dashboard::handler))
        .fallback(proxy::handler)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

#[cfg(test)]
pub(crate) fn test_state(config: Config) -> AppState {
    let metrics = Arc::new(Metrics::new().expect("metrics registry should build"));
    let analytics = Arc::new(Analytics::disabled(&config.analytics));
    AppState::new(Arc::new(config), metrics, analytics, CancellationToken::new())
        .expect("test state should build")
}
