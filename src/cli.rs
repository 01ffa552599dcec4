//! Command-line interface for ollama-proxy
//!
//! Provides argument parsing and subcommand handling for the binary.

use clap::{Parser, Subcommand};

/// Transparent metrics and analytics proxy for Ollama
#[derive(Parser)]
#[command(name = "ollama-proxy")]
#[command(version)]
#[command(about = "Transparent metrics and analytics proxy for Ollama")]
#[command(
    long_about = "ollama-proxy starts Ollama on a hidden port and serves the Ollama API on the \
    usual one, recording Prometheus metrics and per-request analytics for every call \
    without changing the responses."
)]
pub struct Cli {
    /// Path to configuration file (missing file means defaults)
    #[arg(short, long, default_value = "ollama-proxy.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the proxy (the default)
    Serve,
    /// Generate a template configuration file
    Config {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },
}

/// Generate template configuration content
pub fn generate_config_template() -> &'static str {
    r#"# ollama-proxy configuration
# ==========================
#
# Every key is optional; the values below are the defaults.
# Environment variables override the file: PROXY_PORT, OLLAMA_BACKEND_PORT,
# OLLAMA_EXECUTABLE_PATH, MAX_CONCURRENT_REQUESTS, ANALYTICS_BACKEND,
# ANALYTICS_DIR, ANALYTICS_RETENTION_DAYS.

# ─────────────────────────────────────────────────────────────────────────────
# SERVER (where clients connect)
# ─────────────────────────────────────────────────────────────────────────────

[server]
host = "0.0.0.0"
# The port applications expect Ollama on
port = 11434
# How long in-flight requests may finish after shutdown starts
shutdown_grace_seconds = 10
max_request_body_bytes = 67108864

# ─────────────────────────────────────────────────────────────────────────────
# BACKEND (the real Ollama server)
# ─────────────────────────────────────────────────────────────────────────────

[backend]
host = "127.0.0.1"
port = 11435
executable = "ollama"
args = ["serve"]
# Set to false to proxy an Ollama you run yourself (no restarts)
manage_process = true
startup_timeout_seconds = 30
dial_timeout_seconds = 30
# Generous: the backend may load a model before sending the first byte
response_header_timeout_seconds = 60
idle_timeout_seconds = 90
max_idle_per_host = 10

# ─────────────────────────────────────────────────────────────────────────────
# ADMISSION CONTROL
# ─────────────────────────────────────────────────────────────────────────────

[admission]
max_concurrent_requests = 50

# ─────────────────────────────────────────────────────────────────────────────
# ANALYTICS
# ─────────────────────────────────────────────────────────────────────────────

[analytics]
# "sqlite" or "none"
backend = "sqlite"
data_dir = "ollama_analytics"
retention_days = 7
queue_capacity = 1000
cleanup_interval_seconds = 3600
busy_timeout_ms = 5000

# ─────────────────────────────────────────────────────────────────────────────
# HEALTH SUPERVISOR
# ─────────────────────────────────────────────────────────────────────────────

[health]
enabled = true
interval_seconds = 30
probe_timeout_seconds = 10
# Consecutive failed probes before the backend is restarted
failure_threshold = 1
restart_startup_timeout_seconds = 30
port_release_delay_seconds = 2

# ─────────────────────────────────────────────────────────────────────────────
# OBSERVABILITY
# ─────────────────────────────────────────────────────────────────────────────

[observability]
# Log level: "trace", "debug", "info", "warn", "error" (RUST_LOG takes precedence)
log_level = "info"
# HTML served at /analytics
dashboard_path = "analytics_dashboard.html"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn default_config_path() {
        let cli = Cli::parse_from(["ollama-proxy"]);
        assert_eq!(cli.config, "ollama-proxy.toml");
        assert!(cli.command.is_none());
    }

    #[test]
    fn custom_config_path() {
        let cli = Cli::parse_from(["ollama-proxy", "--config", "custom.toml", "serve"]);
        assert_eq!(cli.config, "custom.toml");
        assert!(matches!(cli.command, Some(Command::Serve)));
    }

    #[test]
    fn config_subcommand_with_output() {
        let cli = Cli::parse_from(["ollama-proxy", "config", "-o", "my-config.toml"]);
        assert!(matches!(
            cli.command,
            Some(Command::Config { output: Some(ref path) }) if path == "my-config.toml"
        ));
    }

    #[test]
    fn template_parses_as_default_config() {
        let config: Config = toml::from_str(generate_config_template())
            .expect("template should be valid config");
        config.validate().expect("template should validate");

        let defaults = Config::default();
        assert_eq!(config.server.port, defaults.server.port);
        assert_eq!(config.backend.port, defaults.backend.port);
        assert_eq!(
            config.server.max_request_body_bytes,
            defaults.server.max_request_body_bytes
        );
        assert_eq!(config.analytics.retention_days, defaults.analytics.retention_days);
        assert_eq!(config.health.failure_threshold, defaults.health.failure_threshold);
    }

    #[test]
    fn template_has_all_sections() {
        let template = generate_config_template();
        for section in [
            "[server]",
            "[backend]",
            "[admission]",
            "[analytics]",
            "[health]",
            "[observability]",
        ] {
            assert!(template.contains(section), "missing {}", section);
        }
    }
}
