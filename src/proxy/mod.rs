//! The observing reverse-proxy pipeline
//!
//! Every request that is not one of the proxy's own endpoints goes through
//! [`Pipeline::handle`]:
//!
//! 1. wait for an admission slot (or give up with 408 if cancelled)
//! 2. buffer the request body and extract model, prompt and endpoint
//! 3. categorize the prompt and build the [`RequestContext`]
//! 4. forward to the backend
//! 5. stream the response through the interceptor, or buffer and replay it
//! 6. report exactly one observation to metrics and analytics
//!
//! Each admitted request holds a token of the pipeline's in-flight tracker
//! until its observation is reported, so shutdown can wait for the last
//! records before the analytics queue is closed.

pub mod admission;
pub mod context;
pub mod extract;
pub mod forwarder;
pub mod interceptor;
pub mod reporter;

pub use admission::AdmissionController;
pub use context::{Outcome, RequestContext};
pub use forwarder::Forwarder;
pub use interceptor::{ObservedStream, StreamObserver, StreamSummary};
pub use reporter::Reporter;

use crate::analytics::Analytics;
use crate::categorizer::PromptCategorizer;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics::{ActiveRequestGuard, Metrics};
use crate::middleware::request_id::RequestId;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use extract::{TerminalStats, endpoint_from_path, request_fields, response_text};
use forwarder::{error_chain, is_streaming, response_headers};
use http::HeaderMap;
use http::request::Parts;
use http::header::{CONTENT_TYPE, USER_AGENT};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tokio_util::task::{TaskTracker, task_tracker::TaskTrackerToken};

/// Shared request pipeline; one per process
pub struct Pipeline {
    admission: AdmissionController,
    forwarder: Forwarder,
    categorizer: Arc<PromptCategorizer>,
    metrics: Arc<Metrics>,
    reporter: Reporter,
    shutdown: CancellationToken,
    max_body_bytes: usize,
    in_flight: TaskTracker,
}

impl Pipeline {
    /// Build the pipeline from configuration
    ///
    /// `shutdown` cancels requests still waiting for admission when the
    /// process begins shutting down.
    pub fn new(
        config: &Config,
        categorizer: Arc<PromptCategorizer>,
        metrics: Arc<Metrics>,
        analytics: Arc<Analytics>,
        shutdown: CancellationToken,
    ) -> AppResult<Self> {
        Ok(Self {
            admission: AdmissionController::new(config.admission.max_concurrent_requests),
            forwarder: Forwarder::new(&config.backend)?,
            categorizer,
            reporter: Reporter::new(metrics.clone(), analytics),
            metrics,
            shutdown,
            max_body_bytes: config.server.max_request_body_bytes,
            in_flight: TaskTracker::new(),
        })
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Requests admitted but not yet reported
    pub fn unreported(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait up to `timeout` for every admitted request to be reported
    ///
    /// Returns `false` if some were still outstanding when time ran out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.in_flight.close();
        tokio::time::timeout(timeout, self.in_flight.wait())
            .await
            .is_ok()
    }

    /// Proxy one request to the backend and observe it
    pub async fn handle(&self, request: Request) -> Response {
        let started = Instant::now();
        let received_at = Utc::now();
        let (parts, body) = request.into_parts();

        let mut waiting = AdmissionWait {
            metrics: &self.metrics,
            admitted: false,
        };
        let Some(permit) = self.admission.admit(&self.shutdown.child_token()).await else {
            tracing::debug!(path = %parts.uri.path(), "Request cancelled while queued for admission");
            drop(waiting);
            return AppError::AdmissionCancelled.into_response();
        };
        waiting.admitted = true;

        let body = match Limited::new(body, self.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    limit_bytes = self.max_body_bytes,
                    "Request body too large"
                );
                return AppError::PayloadTooLarge {
                    limit_bytes: self.max_body_bytes,
                }
                .into_response();
            }
            Err(e) => {
                tracing::warn!(path = %parts.uri.path(), error = %e, "Failed to read request body");
                return AppError::RequestBody(e.to_string()).into_response();
            }
        };

        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let fields = request_fields(&body);
        let category = self.categorizer.categorize(&fields.prompt);
        let ctx = RequestContext {
            request_id: parts.extensions.get::<RequestId>().copied(),
            started,
            received_at,
            endpoint: endpoint_from_path(parts.uri.path()),
            model: fields.model,
            prompt: fields.prompt,
            category,
            client_ip: client_ip(&parts.headers, peer),
            user_agent: parts
                .headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        };

        let active = self
            .metrics
            .track_active(&ctx.model, &ctx.endpoint, &ctx.category);

        // Once forwarded, the request runs to its observation even if the
        // client goes away; dropping this handler only drops the response.
        let forwarding = Forwarding {
            forwarder: self.forwarder.clone(),
            reporter: self.reporter.clone(),
            ctx,
            active,
            permit,
            tracked: self.in_flight.token(),
        };
        let task = tokio::spawn(forwarding.run(parts, peer, body));
        match task.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "Forwarding task failed");
                AppError::Internal("forwarding task failed".to_string()).into_response()
            }
        }
    }
}

/// A request past admission and parsing, owning everything its observation needs
struct Forwarding {
    forwarder: Forwarder,
    reporter: Reporter,
    ctx: RequestContext,
    active: ActiveRequestGuard,
    permit: OwnedSemaphorePermit,
    tracked: TaskTrackerToken,
}

impl Forwarding {
    async fn run(self, parts: Parts, peer: Option<SocketAddr>, body: Bytes) -> Response {
        let Forwarding {
            forwarder,
            reporter,
            ctx,
            active,
            permit,
            tracked,
        } = self;

        let backend_response = match forwarder
            .forward(
                parts.method.clone(),
                &parts.uri,
                &parts.headers,
                peer.map(|addr| addr.ip()),
                body,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let status = e.status_code().as_u16();
                reporter.report(
                    &ctx,
                    &Outcome::transport_error(status, ctx.elapsed(), e.to_string()),
                );
                return e.into_response();
            }
        };

        let status = backend_response.status();
        let headers = response_headers(backend_response.headers());
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());

        if is_streaming(content_type, parts.uri.path()) {
            let started = ctx.started;
            let status_code = status.as_u16();
            let observer = StreamObserver::new(started, move |summary| {
                reporter.report(&ctx, &stream_outcome(status_code, summary));
                // the slot and the gauge are held until the stream is done
                drop(active);
                drop(permit);
                drop(tracked);
            });
            let stream = ObservedStream::new(backend_response.bytes_stream(), observer);
            return build_response(status, headers, Body::from_stream(stream));
        }

        match backend_response.bytes().await {
            Ok(bytes) => {
                let value = serde_json::from_slice::<serde_json::Value>(&bytes).ok();
                let outcome = Outcome {
                    status_code: status.as_u16(),
                    duration: ctx.elapsed(),
                    response_text: value
                        .as_ref()
                        .and_then(response_text)
                        .unwrap_or_default()
                        .to_string(),
                    stats: value
                        .as_ref()
                        .map(TerminalStats::from_value)
                        .unwrap_or_default(),
                    ..Default::default()
                };
                reporter.report(&ctx, &outcome);
                build_response(status, headers, Body::from(bytes))
            }
            Err(e) => {
                let err = AppError::BackendUnavailable {
                    reason: error_chain(&e),
                };
                reporter.report(
                    &ctx,
                    &Outcome::transport_error(
                        err.status_code().as_u16(),
                        ctx.elapsed(),
                        err.to_string(),
                    ),
                );
                err.into_response()
            }
        }
    }
}

/// Counts the request as cancelled if it is dropped before admission
///
/// A client disconnect drops the handler future mid-wait, so the count has
/// to happen on drop rather than on the `None` branch.
struct AdmissionWait<'a> {
    metrics: &'a Metrics,
    admitted: bool,
}

impl Drop for AdmissionWait<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            self.metrics.admission_cancelled();
        }
    }
}

/// Client identity for analytics
///
/// The peer address, or `"<x-forwarded-for> (via <peer>)"` when the client
/// sent that header.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let peer_ip = peer.map(|addr| addr.ip().to_string());

    match (forwarded, peer_ip) {
        (Some(fwd), Some(ip)) => format!("{} (via {})", fwd, ip),
        (Some(fwd), None) => fwd.to_string(),
        (None, Some(ip)) => ip,
        (None, None) => "unknown".to_string(),
    }
}

/// Outcome of a streamed response from what the interceptor observed
pub fn stream_outcome(status_code: u16, summary: StreamSummary) -> Outcome {
    Outcome {
        status_code,
        completed: Some(summary.completed()),
        duration: summary.duration,
        response_text: summary.response_text,
        time_to_first_token: summary.time_to_first_token,
        stats: summary.terminal.unwrap_or_default(),
        error: summary.error,
        streamed: true,
    }
}

fn build_response(status: http::StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
