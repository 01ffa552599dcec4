//! Configuration management for the proxy
//!
//! Parses an optional TOML configuration file, layers environment overrides on
//! top, and validates the result. Every section has serde defaults so an empty
//! (or missing) file yields a working configuration.

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Listener configuration (where clients connect)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long in-flight requests may keep running after shutdown starts
    pub shutdown_grace_seconds: u64,
    /// Upper bound for buffered request bodies
    pub max_request_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 11434,
            shutdown_grace_seconds: 10,
            max_request_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Backend process and connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub executable: String,
    pub args: Vec<String>,
    /// When false the proxy forwards to an already-running backend and never
    /// starts, stops or restarts it.
    pub manage_process: bool,
    pub startup_timeout_seconds: u64,
    pub dial_timeout_seconds: u64,
    /// Time allowed for the backend to produce response headers. Generous
    /// because the backend may be loading a model first.
    pub response_header_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_idle_per_host: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11435,
            executable: "ollama".to_string(),
            args: vec!["serve".to_string()],
            manage_process: true,
            startup_timeout_seconds: 30,
            dial_timeout_seconds: 30,
            response_header_timeout_seconds: 60,
            idle_timeout_seconds: 90,
            max_idle_per_host: 10,
        }
    }
}

impl BackendConfig {
    /// Base URL requests are forwarded to, e.g. `http://127.0.0.1:11435`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_seconds)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_seconds)
    }

    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_secs(self.response_header_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }
}

/// Admission control settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_concurrent_requests: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 50,
        }
    }
}

/// Which analytics backend to use
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AnalyticsBackend {
    Sqlite,
    None,
}

impl AnalyticsBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsBackend::Sqlite => "sqlite",
            AnalyticsBackend::None => "none",
        }
    }
}

impl FromStr for AnalyticsBackend {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(AnalyticsBackend::Sqlite),
            "none" | "disabled" | "off" => Ok(AnalyticsBackend::None),
            other => Err(AppError::Config(format!(
                "unknown analytics backend '{}', expected 'sqlite' or 'none'",
                other
            ))),
        }
    }
}

/// Analytics store settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub backend: AnalyticsBackend,
    pub data_dir: PathBuf,
    pub retention_days: u32,
    pub queue_capacity: usize,
    pub cleanup_interval_seconds: u64,
    pub busy_timeout_ms: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            backend: AnalyticsBackend::Sqlite,
            data_dir: PathBuf::from("ollama_analytics"),
            retention_days: 7,
            queue_capacity: 1000,
            cleanup_interval_seconds: 3600,
            busy_timeout_ms: 5000,
        }
    }
}

impl AnalyticsConfig {
    /// SQLite database file inside `data_dir`
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("ollama_analytics.db")
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Health supervisor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub probe_timeout_seconds: u64,
    /// Consecutive probe failures before a restart is attempted
    pub failure_threshold: u32,
    pub restart_startup_timeout_seconds: u64,
    pub port_release_delay_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            probe_timeout_seconds: 10,
            failure_threshold: 1,
            restart_startup_timeout_seconds: 30,
            port_release_delay_seconds: 2,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn restart_startup_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_startup_timeout_seconds)
    }

    pub fn port_release_delay(&self) -> Duration {
        Duration::from_secs(self.port_release_delay_seconds)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// HTML file served at `/analytics`
    pub dashboard_path: PathBuf,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            dashboard_path: PathBuf::from("analytics_dashboard.html"),
        }
    }
}

/// Longest accepted retention, in days (one hundred years)
pub const MAX_RETENTION_DAYS: u32 = 36_500;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from a TOML file
    ///
    /// The file must exist. Environment overrides are not applied; see
    /// [`Config::load`] for the full startup path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path_display = path.as_ref().display().to_string();

        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            }
        })?;

        let config: Self =
            toml::from_str(&content).map_err(|source| AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            })?;

        config
            .validate()
            .map_err(|e| AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Startup loader: file (if present) + process environment + validation
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Same as [`Config::load`] with an injectable environment lookup
    pub fn load_with_env<P, F>(path: P, env: F) -> AppResult<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();

        let mut config = if path_ref.exists() {
            let content =
                std::fs::read_to_string(path_ref).map_err(|source| AppError::ConfigFileRead {
                    path: path_display.clone(),
                    source,
                })?;
            toml::from_str::<Self>(&content).map_err(|source| AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            })?
        } else {
            tracing::info!(
                path = %path_display,
                "Config file not found, using defaults"
            );
            Self::default()
        };

        config
            .apply_env_overrides(env)
            .and_then(|_| config.validate())
            .map_err(|e| AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Apply environment-style overrides for the deployment knobs
    pub fn apply_env_overrides<F>(&mut self, env: F) -> AppResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = env("PROXY_PORT") {
            self.server.port = parse_env("PROXY_PORT", &value)?;
        }
        if let Some(value) = env("OLLAMA_BACKEND_PORT") {
            self.backend.port = parse_env("OLLAMA_BACKEND_PORT", &value)?;
        }
        if let Some(value) = env("OLLAMA_EXECUTABLE_PATH") {
            if !value.trim().is_empty() {
                self.backend.executable = value;
            }
        }
        if let Some(value) = env("MAX_CONCURRENT_REQUESTS") {
            self.admission.max_concurrent_requests = parse_env("MAX_CONCURRENT_REQUESTS", &value)?;
        }
        if let Some(value) = env("ANALYTICS_BACKEND") {
            self.analytics.backend = value.parse()?;
        }
        if let Some(value) = env("ANALYTICS_DIR") {
            if !value.trim().is_empty() {
                self.analytics.data_dir = PathBuf::from(value);
            }
        }
        if let Some(value) = env("ANALYTICS_RETENTION_DAYS") {
            self.analytics.retention_days = parse_env("ANALYTICS_RETENTION_DAYS", &value)?;
        }
        Ok(())
    }

    /// Validate configuration after parsing
    pub fn validate(&self) -> AppResult<()> {
        if self.server.port == 0 {
            return Err(AppError::Config("server.port must be greater than 0".to_string()));
        }
        if self.backend.port == 0 {
            return Err(AppError::Config("backend.port must be greater than 0".to_string()));
        }
        if self.server.port == self.backend.port && self.backend.is_loopback() {
            return Err(AppError::Config(format!(
                "server.port and backend.port are both {}. The proxy cannot listen on \
                the port the backend is bound to.",
                self.server.port
            )));
        }
        if self.server.max_request_body_bytes == 0 {
            return Err(AppError::Config(
                "server.max_request_body_bytes must be greater than 0".to_string(),
            ));
        }
        if self.backend.executable.trim().is_empty() {
            return Err(AppError::Config(
                "backend.executable must not be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("server.shutdown_grace_seconds", self.server.shutdown_grace_seconds),
            ("backend.startup_timeout_seconds", self.backend.startup_timeout_seconds),
            ("backend.dial_timeout_seconds", self.backend.dial_timeout_seconds),
            (
                "backend.response_header_timeout_seconds",
                self.backend.response_header_timeout_seconds,
            ),
            ("backend.idle_timeout_seconds", self.backend.idle_timeout_seconds),
            ("analytics.cleanup_interval_seconds", self.analytics.cleanup_interval_seconds),
            ("health.interval_seconds", self.health.interval_seconds),
            ("health.probe_timeout_seconds", self.health.probe_timeout_seconds),
            (
                "health.restart_startup_timeout_seconds",
                self.health.restart_startup_timeout_seconds,
            ),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.admission.max_concurrent_requests == 0 {
            return Err(AppError::Config(
                "admission.max_concurrent_requests must be greater than 0".to_string(),
            ));
        }
        if self.analytics.retention_days == 0 {
            return Err(AppError::Config(
                "analytics.retention_days must be greater than 0".to_string(),
            ));
        }
        if self.analytics.retention_days > MAX_RETENTION_DAYS {
            return Err(AppError::Config(format!(
                "analytics.retention_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.analytics.queue_capacity == 0 {
            return Err(AppError::Config(
                "analytics.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.health.failure_threshold == 0 {
            return Err(AppError::Config(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.observability.log_level.as_str()) {
            return Err(AppError::Config(format!(
                "observability.log_level '{}' is invalid, expected one of {:?}",
                self.observability.log_level, VALID_LOG_LEVELS
            )));
        }

        Ok(())
    }
}

impl BackendConfig {
    fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "localhost" | "0.0.0.0" | "::1")
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> AppResult<T> {
    value.trim().parse::<T>().map_err(|_| {
        AppError::Config(format!("environment variable {}='{}' is not valid", key, value))
    })
}

impl FromStr for Config {
    type Err = AppError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config =
            toml::from_str(toml_str).map_err(|source| AppError::ConfigParseFailed {
                path: "<string>".to_string(),
                source,
            })?;

        config.validate()?;
        Ok(config)
    }
}
