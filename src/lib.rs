//! ollama-proxy - transparent metrics and analytics proxy for a local Ollama server
//!
//! Forwards every request to the backend unchanged while observing it:
//! Prometheus metrics with bounded label cardinality, one analytics record
//! per request in a single-writer SQLite store, admission control, and a
//! health supervisor that restarts the backend when it dies.

pub mod analytics;
pub mod backend;
pub mod categorizer;
pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod telemetry;
