//! HTTP forwarding to the backend
//!
//! Builds one pooled `reqwest::Client` for the process and rewrites headers
//! the way a reverse proxy must: hop-by-hop headers are dropped in both
//! directions and `X-Forwarded-*` headers are set on the way in.

use crate::config::BackendConfig;
use crate::error::{AppError, AppResult};
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Uri};
use std::error::Error as StdError;
use std::net::IpAddr;
use std::time::Duration;

/// Headers that only apply to a single connection
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Pooled client bound to one backend base URL
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    base_url: String,
    header_timeout: Duration,
}

impl Forwarder {
    pub fn new(config: &BackendConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout())
            .pool_idle_timeout(config.idle_timeout())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .tcp_keepalive(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url(),
            header_timeout: config.response_header_timeout(),
        })
    }

    /// Override the response-header timeout
    pub fn with_header_timeout(mut self, timeout: Duration) -> Self {
        self.header_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Backend URL for an incoming request URI (path and query preserved)
    pub fn target_url(&self, uri: &Uri) -> String {
        let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Send a request to the backend and wait for its response headers
    ///
    /// The body of the returned response has not been read yet.
    pub async fn forward(
        &self,
        method: Method,
        uri: &Uri,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
        body: Bytes,
    ) -> AppResult<reqwest::Response> {
        let url = self.target_url(uri);
        let request = self
            .client
            .request(method, &url)
            .headers(forward_headers(headers, peer))
            .body(body);

        match tokio::time::timeout(self.header_timeout, request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(AppError::BackendUnavailable {
                reason: error_chain(&e),
            }),
            Err(_) => Err(AppError::BackendTimeout {
                timeout_seconds: self.header_timeout.as_secs(),
            }),
        }
    }

    /// `GET /api/tags`, used by the connectivity check
    pub async fn list_models(&self) -> AppResult<serde_json::Value> {
        let url = format!("{}/api/tags", self.base_url);
        let response = tokio::time::timeout(self.header_timeout, self.client.get(&url).send())
            .await
            .map_err(|_| AppError::BackendTimeout {
                timeout_seconds: self.header_timeout.as_secs(),
            })?
            .map_err(|e| AppError::BackendUnavailable {
                reason: error_chain(&e),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::BackendUnavailable {
                reason: format!("backend returned HTTP {}", status.as_u16()),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AppError::BackendUnavailable {
                reason: format!("invalid model list: {}", error_chain(&e)),
            })
    }
}

/// Request headers as sent to the backend
pub fn forward_headers(incoming: &HeaderMap, peer: Option<IpAddr>) -> HeaderMap {
    let mut headers = strip_hop_by_hop(incoming);
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);

    if let Some(ip) = peer {
        let forwarded_for = match incoming
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.trim().is_empty())
        {
            Some(prior) => format!("{}, {}", prior, ip),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert(HeaderName::from_static(X_FORWARDED_FOR), value);
        }
    }

    if let Some(host) = incoming.get(header::HOST) {
        headers.insert(HeaderName::from_static(X_FORWARDED_HOST), host.clone());
    }
    headers.insert(
        HeaderName::from_static(X_FORWARDED_PROTO),
        HeaderValue::from_static("http"),
    );

    headers
}

/// Response headers as sent to the client
pub fn response_headers(backend: &HeaderMap) -> HeaderMap {
    let mut headers = strip_hop_by_hop(backend);
    // the body is re-framed by our server
    headers.remove(header::CONTENT_LENGTH);
    headers
}

fn strip_hop_by_hop(source: &HeaderMap) -> HeaderMap {
    let mut headers = source.clone();

    // headers listed in Connection are hop-by-hop too
    let listed: Vec<String> = source
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in &listed {
        headers.remove(name.as_str());
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

/// Error message including every source in the chain
///
/// reqwest's top-level message is usually just "error sending request"; the
/// useful part ("connection refused") sits further down.
pub fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Whether a response should be treated as a stream of NDJSON lines
pub fn is_streaming(content_type: Option<&str>, path: &str) -> bool {
    let ndjson = content_type
        .map(|ct| ct.to_ascii_lowercase().contains("application/x-ndjson"))
        .unwrap_or(false);
    ndjson || path.contains("/generate") || path.contains("/chat")
}
