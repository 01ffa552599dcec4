//! Hands a finished request to metrics and analytics

use super::context::{Outcome, RequestContext};
use crate::analytics::{Analytics, Enqueue};
use crate::metrics::Metrics;
use std::sync::Arc;

/// Reports each finished request exactly once
///
/// Called on the request path (or from a streaming body's finalizer), so it
/// never blocks: metrics are in-memory and analytics only enqueue.
#[derive(Clone)]
pub struct Reporter {
    metrics: Arc<Metrics>,
    analytics: Arc<Analytics>,
}

impl Reporter {
    pub fn new(metrics: Arc<Metrics>, analytics: Arc<Analytics>) -> Self {
        Self { metrics, analytics }
    }

    pub fn report(&self, ctx: &RequestContext, outcome: &Outcome) {
        let record = ctx.to_record(outcome);

        // failures are already counted and logged inside observe()
        let _ = self.metrics.observe(&record);

        let output_tokens = record.output_tokens;
        let tokens_per_second = record.tokens_per_second;
        if self.analytics.record(record) == Enqueue::Dropped {
            self.metrics.analytics_dropped();
        }

        if let Some(error) = &outcome.error {
            tracing::warn!(
                request_id = ?ctx.request_id.map(|id| id.to_string()),
                model = %ctx.model,
                endpoint = %ctx.endpoint,
                status = outcome.status_code,
                duration_ms = outcome.duration.as_millis() as u64,
                error = %error,
                "Request failed"
            );
        } else {
            tracing::info!(
                request_id = ?ctx.request_id.map(|id| id.to_string()),
                model = %ctx.model,
                endpoint = %ctx.endpoint,
                category = %ctx.category,
                status = outcome.status_code,
                duration_ms = outcome.duration.as_millis() as u64,
                output_tokens = output_tokens,
                tokens_per_second = tokens_per_second,
                streamed = outcome.streamed,
                "Request completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalyticsBackend, AnalyticsConfig};
    use crate::proxy::context::sample_context;
    use crate::proxy::extract::TerminalStats;
    use std::time::Duration;

    fn success_outcome() -> Outcome {
        Outcome {
            status_code: 200,
            duration: Duration::from_millis(1500),
            response_text: "Hi".to_string(),
            stats: TerminalStats {
                eval_count: 10,
                eval_duration_ns: 1_000_000_000,
                prompt_eval_count: 5,
                ..Default::default()
            },
            streamed: true,
            completed: Some(true),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_report_updates_metrics_and_analytics() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalyticsConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let metrics = Arc::new(Metrics::new().unwrap());
        let analytics = Analytics::open(&config);
        let reporter = Reporter::new(metrics.clone(), analytics.clone());

        reporter.report(&sample_context(), &success_outcome());
        analytics.close().await;

        assert_eq!(metrics.requests_total_count(), 1);
        assert_eq!(analytics.stats().await.total_records, Some(1));
    }

    #[tokio::test]
    async fn test_report_with_analytics_disabled_still_counts_metrics() {
        let config = AnalyticsConfig {
            backend: AnalyticsBackend::None,
            ..Default::default()
        };
        let metrics = Arc::new(Metrics::new().unwrap());
        let analytics = Arc::new(Analytics::disabled(&config));
        let reporter = Reporter::new(metrics.clone(), analytics);

        reporter.report(&sample_context(), &success_outcome());
        assert_eq!(metrics.requests_total_count(), 1);
        assert_eq!(metrics.analytics_dropped_count(), 0);
    }
}
