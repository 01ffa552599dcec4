//! Prometheus metrics collection for the proxy
//!
//! This module provides metrics instrumentation for tracking:
//! - Request duration, generated tokens and generation speed per model/endpoint/category
//! - Request totals by outcome
//! - Requests currently in flight
//! - Health of the proxy's own subsystems (analytics drops, backend restarts,
//!   admission cancellations, metrics recording failures)
//!
//! Metrics are exposed via the `/metrics` endpoint in Prometheus text format.
//!
//! # Cardinality
//!
//! Request metrics are labeled by `{model, endpoint, prompt_category}` only.
//! Client addresses and raw prompt text never become labels; the category
//! label is bounded by [`crate::categorizer::PromptCategorizer`].

use crate::analytics::record::AnalyticsRecord;
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

const REQUEST_LABELS: [&str; 3] = ["model", "endpoint", "prompt_category"];

/// Outcome label for backend restart attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    Success,
    Failure,
}

impl RestartOutcome {
    /// Convert outcome to Prometheus label string
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartOutcome::Success => "success",
            RestartOutcome::Failure => "failure",
        }
    }
}

/// Metrics collector for the proxy
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    request_duration: HistogramVec,
    tokens_generated: HistogramVec,
    tokens_per_second: HistogramVec,
    requests_total: CounterVec,
    active_requests: IntGaugeVec,
    analytics_dropped: IntCounter,
    backend_restarts: IntCounterVec,
    admission_cancelled: IntCounter,
    metrics_recording_failures: IntCounterVec,
}

impl Metrics {
    /// Create a new Metrics instance
    ///
    /// Registers all metrics with a new Prometheus registry.
    ///
    /// # Errors
    ///
    /// Returns an error if metric registration fails (e.g., duplicate names).
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "ollama_request_duration_seconds",
                "Request duration distribution in seconds",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &REQUEST_LABELS,
        )?;

        let tokens_generated = HistogramVec::new(
            HistogramOpts::new("ollama_tokens_generated", "Distribution of tokens generated")
                .buckets(vec![10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0]),
            &REQUEST_LABELS,
        )?;

        let tokens_per_second = HistogramVec::new(
            HistogramOpts::new(
                "ollama_tokens_per_second",
                "Distribution of token generation speed",
            )
            .buckets(vec![
                1.0, 5.0, 10.0, 20.0, 30.0, 50.0, 75.0, 100.0, 150.0, 200.0,
            ]),
            &REQUEST_LABELS,
        )?;

        // Counter: Total requests by outcome
        //
        // Labels: model, endpoint, prompt_category, status (success | error)
        let requests_total = CounterVec::new(
            Opts::new("ollama_requests_total", "Total number of requests"),
            &["model", "endpoint", "prompt_category", "status"],
        )?;

        // Gauge: Requests between admission and the end of their response body
        let active_requests = IntGaugeVec::new(
            Opts::new("ollama_active_requests", "Currently active requests"),
            &REQUEST_LABELS,
        )?;

        // Counter: Analytics records dropped because the write queue was full
        //
        // Alerting: a steady rate means the store cannot keep up with traffic
        let analytics_dropped = IntCounter::with_opts(Opts::new(
            "ollama_proxy_analytics_dropped_total",
            "Analytics records dropped because the write queue was full",
        ))?;

        // Counter: Backend restart attempts by the health supervisor
        //
        // Labels:
        // - outcome: success | failure
        //
        // Cardinality: 2 time series
        let backend_restarts = IntCounterVec::new(
            Opts::new(
                "ollama_proxy_backend_restarts_total",
                "Backend restart attempts triggered by failed liveness probes. \
                Alert on ANY failure - the backend is down until a later restart succeeds.",
            ),
            &["outcome"],
        )?;

        let admission_cancelled = IntCounter::with_opts(Opts::new(
            "ollama_proxy_admission_cancelled_total",
            "Requests cancelled while waiting for a concurrency slot",
        ))?;

        // Counter: Metrics recording operation failures with operation label
        //
        // Labels:
        // - operation: observe_duration | observe_tokens | observe_tokens_per_second | count_request
        //
        // Indicates Prometheus internal errors - the request itself is unaffected.
        let metrics_recording_failures = IntCounterVec::new(
            Opts::new(
                "ollama_proxy_metrics_recording_failures_total",
                "Total number of metrics recording operation failures by operation",
            ),
            &["operation"],
        )?;

        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(tokens_generated.clone()))?;
        registry.register(Box::new(tokens_per_second.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(active_requests.clone()))?;
        registry.register(Box::new(analytics_dropped.clone()))?;
        registry.register(Box::new(backend_restarts.clone()))?;
        registry.register(Box::new(admission_cancelled.clone()))?;
        registry.register(Box::new(metrics_recording_failures.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            request_duration,
            tokens_generated,
            tokens_per_second,
            requests_total,
            active_requests,
            analytics_dropped,
            backend_restarts,
            admission_cancelled,
            metrics_recording_failures,
        })
    }

    /// Record one completed request
    ///
    /// Updates the duration histogram and the request counter, plus the token
    /// histograms when the backend reported generated tokens. Each failing
    /// sub-operation is counted in `ollama_proxy_metrics_recording_failures_total`
    /// and the first error is returned.
    ///
    /// # Data Integrity
    ///
    /// NaN, infinite and negative values are rejected: they would corrupt
    /// every percentile of the histogram.
    pub fn observe(&self, record: &AnalyticsRecord) -> Result<(), prometheus::Error> {
        let labels = [
            record.model.as_str(),
            record.endpoint.as_str(),
            record.category.as_str(),
        ];
        let mut first_error = None;

        let mut track = |operation: &str, result: Result<(), prometheus::Error>| {
            if let Err(e) = result {
                self.metrics_recording_failure(operation);
                tracing::warn!(operation = operation, error = %e, "Failed to record metric");
                first_error.get_or_insert(e);
            }
        };

        track(
            "observe_duration",
            observe_histogram(&self.request_duration, &labels, record.latency),
        );

        track(
            "count_request",
            self.requests_total
                .get_metric_with_label_values(&[
                    labels[0],
                    labels[1],
                    labels[2],
                    record.status.as_str(),
                ])
                .map(|counter| counter.inc()),
        );

        if record.output_tokens > 0 {
            track(
                "observe_tokens",
                observe_histogram(
                    &self.tokens_generated,
                    &labels,
                    record.output_tokens as f64,
                ),
            );
            if record.tokens_per_second > 0.0 {
                track(
                    "observe_tokens_per_second",
                    observe_histogram(&self.tokens_per_second, &labels, record.tokens_per_second),
                );
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Mark a request as in flight until the returned guard is dropped
    pub fn track_active(&self, model: &str, endpoint: &str, category: &str) -> ActiveRequestGuard {
        match self
            .active_requests
            .get_metric_with_label_values(&[model, endpoint, category])
        {
            Ok(gauge) => {
                gauge.inc();
                ActiveRequestGuard { gauge: Some(gauge) }
            }
            Err(e) => {
                self.metrics_recording_failure("track_active");
                tracing::warn!(error = %e, "Failed to track active request");
                ActiveRequestGuard { gauge: None }
            }
        }
    }

    /// Requests currently in flight across all label combinations
    pub fn active_requests_count(&self) -> i64 {
        self.sum_family("ollama_active_requests", |m| {
            m.gauge.value.unwrap_or(0.0)
        }) as i64
    }

    pub fn analytics_dropped(&self) {
        self.analytics_dropped.inc();
    }

    pub fn analytics_dropped_count(&self) -> u64 {
        self.analytics_dropped.get()
    }

    /// Record a backend restart attempt
    pub fn backend_restart(&self, outcome: RestartOutcome) {
        self.backend_restarts
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn backend_restarts_count(&self, outcome: RestartOutcome) -> u64 {
        self.backend_restarts
            .with_label_values(&[outcome.as_str()])
            .get()
    }

    pub fn admission_cancelled(&self) {
        self.admission_cancelled.inc();
    }

    pub fn admission_cancelled_count(&self) -> u64 {
        self.admission_cancelled.get()
    }

    /// Record a metrics recording operation failure
    ///
    /// When metrics recording fails the request continues normally; only the
    /// observability data has a gap.
    pub fn metrics_recording_failure(&self, operation: &str) {
        self.metrics_recording_failures
            .with_label_values(&[operation])
            .inc();
    }

    /// Get the current count of metrics recording failures across all operations
    pub fn metrics_recording_failures_count(&self) -> u64 {
        self.sum_family("ollama_proxy_metrics_recording_failures_total", |m| {
            m.counter.value.unwrap_or(0.0)
        }) as u64
    }

    /// Total `ollama_requests_total` across all label combinations
    pub fn requests_total_count(&self) -> u64 {
        self.sum_family("ollama_requests_total", |m| m.counter.value.unwrap_or(0.0)) as u64
    }

    fn sum_family<F>(&self, name: &str, value: F) -> f64
    where
        F: Fn(&prometheus::proto::Metric) -> f64,
    {
        self.registry
            .gather()
            .iter()
            .find(|mf| mf.name() == name)
            .map(|mf| mf.get_metric().iter().map(&value).sum())
            .unwrap_or(0.0)
    }

    /// Gather all metrics in Prometheus text format
    ///
    /// # Errors
    ///
    /// Returns an error if metric encoding fails.
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let metric_count = metric_families.len();

        tracing::debug!(
            metric_family_count = metric_count,
            "Encoding metrics to Prometheus text format"
        );

        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();

        encoder.encode(&metric_families, &mut buffer).map_err(|e| {
            tracing::error!(
                error = %e,
                metric_family_count = metric_count,
                "Prometheus text encoder failed"
            );
            prometheus::Error::Msg(format!(
                "Failed to encode {} metric families: {}",
                metric_count, e
            ))
        })?;

        String::from_utf8(buffer).map_err(|e| {
            prometheus::Error::Msg(format!(
                "Failed to convert metrics to UTF-8 at byte {}: {}",
                e.utf8_error().valid_up_to(),
                e
            ))
        })
    }
}

fn observe_histogram(
    histogram: &HistogramVec,
    labels: &[&str; 3],
    value: f64,
) -> Result<(), prometheus::Error> {
    if !value.is_finite() || value < 0.0 {
        return Err(prometheus::Error::Msg(format!(
            "Histogram value must be finite and non-negative, got: {}",
            value
        )));
    }
    histogram.get_metric_with_label_values(labels)?.observe(value);
    Ok(())
}

/// Decrements `ollama_active_requests` when dropped
#[must_use = "the request stops counting as active when the guard is dropped"]
pub struct ActiveRequestGuard {
    gauge: Option<IntGauge>,
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        if let Some(gauge) = self.gauge.take() {
            gauge.dec();
        }
    }
}
