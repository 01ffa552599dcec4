//! Logging setup
//!
//! One global `tracing` subscriber: an `EnvFilter` taken from `RUST_LOG`, or
//! built from the configured level, feeding the `fmt` layer. Backend process
//! output is logged under the `ollama_proxy::backend` target, so it follows
//! the same level.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Install the global subscriber
///
/// Returns `true` only for the call that installed it. Later calls, or a
/// subscriber installed elsewhere first, leave logging untouched.
///
/// ```no_run
/// ollama_proxy::telemetry::init("debug");
/// tracing::debug!(port = 11434, "Proxy listening");
/// ```
pub fn init(level: &str) -> bool {
    let mut installed = false;
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

        installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .is_ok();
    });
    installed
}

/// Filter used when `RUST_LOG` is unset
///
/// The HTTP client and server internals stay at `warn` so per-connection
/// noise does not drown out the per-request summaries.
fn default_filter(level: &str) -> String {
    format!("ollama_proxy={level},tower_http=info,hyper=warn,hyper_util=warn,reqwest=warn")
}
