//! Integration tests for the `ollama-proxy config` subcommand
//!
//! Writes the generated template to disk and loads it back through the same
//! path the binary uses, including environment overrides.

use ollama_proxy::cli::generate_config_template;
use ollama_proxy::config::{AnalyticsBackend, Config};
use std::fs;
use tempfile::TempDir;

fn create_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

// ─────────────────────────────────────────────────────────────────────────────
// Template Content Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_generated_template_creates_valid_config_file() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("ollama-proxy.toml");

    fs::write(&config_path, generate_config_template()).expect("Failed to write template");

    let config = Config::load_with_env(&config_path, |_| None)
        .expect("Generated template should load as valid Config");

    assert_eq!(config.server.port, 11434);
    assert_eq!(config.backend.port, 11435);
    assert_eq!(config.admission.max_concurrent_requests, 50);
    assert_eq!(config.analytics.backend, AnalyticsBackend::Sqlite);
    assert!(config.backend.manage_process);
}

#[test]
fn test_template_file_content_matches_generation() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("ollama-proxy.toml");

    let template = generate_config_template();
    fs::write(&config_path, template).expect("Failed to write template");

    let content = fs::read_to_string(&config_path).expect("Failed to read back");
    assert_eq!(content, template);
}

#[test]
fn test_environment_overrides_template_values() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("ollama-proxy.toml");
    fs::write(&config_path, generate_config_template()).unwrap();

    let config = Config::load_with_env(&config_path, |key| match key {
        "PROXY_PORT" => Some("12434".to_string()),
        "ANALYTICS_BACKEND" => Some("none".to_string()),
        "ANALYTICS_RETENTION_DAYS" => Some("30".to_string()),
        _ => None,
    })
    .expect("overrides should apply");

    assert_eq!(config.server.port, 12434);
    assert_eq!(config.analytics.backend, AnalyticsBackend::None);
    assert_eq!(config.analytics.retention_days, 30);
}

#[test]
fn test_edited_template_with_port_clash_is_rejected() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("ollama-proxy.toml");
    let edited = generate_config_template().replace("port = 11435", "port = 11434");
    fs::write(&config_path, edited).unwrap();

    let err = Config::load_with_env(&config_path, |_| None)
        .expect_err("proxy and backend on the same port must be rejected");
    assert!(err.to_string().contains("11434"), "error: {}", err);
}

#[test]
fn test_missing_config_file_falls_back_to_defaults() {
    let temp_dir = create_temp_dir();
    let config_path = temp_dir.path().join("does-not-exist.toml");

    let config = Config::load_with_env(&config_path, |_| None)
        .expect("a missing file means defaults");

    assert_eq!(config.server.port, 11434);
    assert_eq!(config.health.failure_threshold, 1);
}
