//! Backend process launching, readiness and liveness
//!
//! The launcher and the probe are traits so the supervisor can be driven by
//! fakes in tests; [`ProcessLauncher`] and [`HttpProbe`] are the real ones.

use crate::config::BackendConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Interval between readiness polls
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A running backend process
///
/// Replaced, never mutated, when the supervisor restarts the backend.
#[derive(Debug)]
pub struct BackendHandle {
    pid: Option<u32>,
    port: u16,
    child: Option<Child>,
}

impl BackendHandle {
    pub fn new(pid: Option<u32>, port: u16, child: Option<Child>) -> Self {
        Self {
            pid,
            port,
            child,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Kill the process and reap it
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        tracing::info!(pid = ?self.pid, port = self.port, "Stopping backend process");
        if let Err(e) = child.kill().await {
            tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill backend process");
            return;
        }
        tracing::info!(pid = ?self.pid, "Backend process stopped");
    }
}

/// Starts a backend process
#[async_trait]
pub trait BackendLauncher: Send + Sync {
    async fn launch(&self) -> AppResult<BackendHandle>;
}

/// Launches `<executable> <args...>` bound to the configured backend port
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: String,
    args: Vec<String>,
    port: u16,
}

impl ProcessLauncher {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.args.clone(),
            port: config.port,
        }
    }
}

#[async_trait]
impl BackendLauncher for ProcessLauncher {
    async fn launch(&self) -> AppResult<BackendHandle> {
        tracing::info!(
            executable = %self.executable,
            args = ?self.args,
            port = self.port,
            "Starting backend process"
        );

        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .env("OLLAMA_HOST", format!("127.0.0.1:{}", self.port))
            .env("OLLAMA_KEEP_ALIVE", "-1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::BackendLaunch {
                executable: self.executable.clone(),
                reason: e.to_string(),
            })?;

        let pid = child.id();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, OutputStream::Stderr));
        }

        tracing::info!(pid = ?pid, port = self.port, "Backend process started");
        Ok(BackendHandle::new(pid, self.port, Some(child)))
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

async fn forward_output<R>(reader: R, stream: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match stream {
                OutputStream::Stdout => tracing::debug!(target: "ollama_proxy::backend", "{}", line),
                OutputStream::Stderr => tracing::warn!(target: "ollama_proxy::backend", "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(stream = ?stream, error = %e, "Backend output read error");
                break;
            }
        }
    }
}

/// Fail with `PortInUse` if something is already listening on `host:port`
pub async fn ensure_port_free(host: &str, port: u16) -> AppResult<()> {
    match tokio::net::TcpListener::bind((host, port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) => {
            tracing::debug!(host = %host, port = port, error = %e, "Port check failed");
            Err(AppError::PortInUse { port })
        }
    }
}

/// Checks whether the backend answers
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    /// `Err` carries a human-readable reason
    async fn probe(&self) -> Result<(), String>;
}

/// `GET /api/tags` must answer 200
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build probe client: {}", e)))?;
        Ok(Self {
            client,
            url: format!("{}/api/tags", base_url),
        })
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| crate::proxy::forwarder::error_chain(&e))?;

        if response.status() == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(format!("backend returned HTTP {}", response.status().as_u16()))
        }
    }
}

/// Poll `probe` every second until it succeeds or `timeout` elapses
pub async fn wait_for_ready(probe: &dyn LivenessProbe, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match probe.probe().await {
            Ok(()) => return true,
            Err(reason) => tracing::debug!(reason = %reason, "Backend not ready yet"),
        }
        if tokio::time::Instant::now() + READY_POLL_INTERVAL > deadline {
            return false;
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe answering from a script, then with `fallback`
    pub struct ScriptedProbe {
        script: Mutex<VecDeque<bool>>,
        fallback: Mutex<bool>,
        calls: AtomicUsize,
    }

    impl ScriptedProbe {
        pub fn new(fallback: bool) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(fallback),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn push(&self, healthy: bool) {
            self.script.lock().push_back(healthy);
        }

        pub fn set_fallback(&self, healthy: bool) {
            *self.fallback.lock() = healthy;
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LivenessProbe for ScriptedProbe {
        async fn probe(&self) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let healthy = self
                .script
                .lock()
                .pop_front()
                .unwrap_or(*self.fallback.lock());
            if healthy {
                Ok(())
            } else {
                Err("scripted failure".to_string())
            }
        }
    }

    /// Launcher that never spawns anything
    pub struct FakeLauncher {
        launches: AtomicUsize,
        fail_after: Option<usize>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self {
                launches: AtomicUsize::new(0),
                fail_after: None,
            }
        }

        /// Succeed for the first `n` launches, fail afterwards
        pub fn failing_after(n: usize) -> Self {
            Self {
                launches: AtomicUsize::new(0),
                fail_after: Some(n),
            }
        }

        pub fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendLauncher for FakeLauncher {
        async fn launch(&self) -> AppResult<BackendHandle> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_after.is_some_and(|limit| n >= limit) {
                return Err(AppError::BackendLaunch {
                    executable: "fake".to_string(),
                    reason: "scripted launch failure".to_string(),
                });
            }
            Ok(BackendHandle::new(Some(1000 + n as u32), 11435, None))
        }
    }
}
