//! Health supervisor: probes the backend and restarts it when it dies
//!
//! ```text
//! Starting -> Ready -> Degraded -> Restarting -> Ready
//!                 \                          \-> Degraded (restart failed, keep ticking)
//!                  \-> Stopped
//! ```
//!
//! The supervisor owns the current [`BackendHandle`]. A restart takes the old
//! handle out, stops it, and stores a freshly launched one.

use super::process::{BackendHandle, BackendLauncher, LivenessProbe, wait_for_ready};
use crate::config::HealthConfig;
use crate::error::{AppError, AppResult};
use crate::metrics::{Metrics, RestartOutcome};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Liveness state of the supervised backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Starting,
    Ready,
    Degraded,
    Restarting,
    Stopped,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Starting => "starting",
            BackendState::Ready => "ready",
            BackendState::Degraded => "degraded",
            BackendState::Restarting => "restarting",
            BackendState::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Shared {
    launcher: Arc<dyn BackendLauncher>,
    probe: Arc<dyn LivenessProbe>,
    config: HealthConfig,
    metrics: Arc<Metrics>,
    handle: Mutex<Option<BackendHandle>>,
    state: RwLock<BackendState>,
    consecutive_failures: AtomicU32,
}

/// Owns the backend process and its monitoring task
pub struct Supervisor {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        launcher: Arc<dyn BackendLauncher>,
        probe: Arc<dyn LivenessProbe>,
        config: HealthConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                launcher,
                probe,
                config,
                metrics,
                handle: Mutex::new(None),
                state: RwLock::new(BackendState::Starting),
                consecutive_failures: AtomicU32::new(0),
            }),
            cancel: CancellationToken::new(),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> BackendState {
        *self.shared.state.read()
    }

    /// PID of the current backend process, if one is running
    pub async fn pid(&self) -> Option<u32> {
        self.shared.handle.lock().await.as_ref().and_then(|h| h.pid())
    }

    /// Launch the backend and wait until it answers
    ///
    /// # Errors
    ///
    /// `BackendLaunch` if the process cannot be started, `BackendNotReady` if
    /// it does not answer within `timeout`. Both are fatal at startup.
    pub async fn start_backend(&self, timeout: Duration) -> AppResult<()> {
        self.shared.set_state(BackendState::Starting);
        let handle = self.shared.launcher.launch().await?;
        let port = handle.port();
        *self.shared.handle.lock().await = Some(handle);

        if !wait_for_ready(self.shared.probe.as_ref(), timeout).await {
            return Err(AppError::BackendNotReady {
                port,
                timeout_seconds: timeout.as_secs(),
            });
        }

        self.shared.set_state(BackendState::Ready);
        tracing::info!(port = port, "Backend is ready");
        Ok(())
    }

    /// Start the periodic liveness check
    pub fn spawn_monitor(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            shared.monitor(cancel).await;
        }));
        tracing::info!(
            interval_seconds = self.shared.config.interval_seconds,
            failure_threshold = self.shared.config.failure_threshold,
            "Health supervisor started"
        );
    }

    pub fn is_monitoring(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the monitoring task and wait for it to exit
    ///
    /// Must run before the backend is stopped on shutdown, otherwise the
    /// monitor could mistake the deliberate stop for a crash.
    pub async fn stop_monitor(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Health supervisor task ended abnormally");
            }
            tracing::info!("Health supervisor stopped");
        }
    }

    /// Stop the backend process
    pub async fn stop_backend(&self) {
        let handle = self.shared.handle.lock().await.take();
        if let Some(mut handle) = handle {
            handle.stop().await;
        }
        self.shared.set_state(BackendState::Stopped);
    }

    /// Run one liveness check (and a restart if it is due)
    pub async fn check_now(&self) {
        self.shared.tick().await;
    }
}

impl Shared {
    fn set_state(&self, state: BackendState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!(from = %*current, to = %state, "Backend state changed");
            *current = state;
        }
    }

    async fn monitor(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; the backend was just checked
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
    }

    async fn tick(&self) {
        let probe_timeout = self.config.probe_timeout();
        let result = match tokio::time::timeout(probe_timeout, self.probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "liveness probe timed out after {}s",
                probe_timeout.as_secs()
            )),
        };

        match result {
            Ok(()) => {
                let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if previous > 0 {
                    tracing::info!(previous_failures = previous, "Backend recovered");
                }
                self.set_state(BackendState::Ready);
            }
            Err(reason) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                self.set_state(BackendState::Degraded);
                tracing::warn!(
                    consecutive_failures = failures,
                    threshold = self.config.failure_threshold,
                    reason = %reason,
                    "Backend liveness check failed"
                );
                if failures >= self.config.failure_threshold {
                    self.restart().await;
                }
            }
        }
    }

    async fn restart(&self) {
        self.set_state(BackendState::Restarting);
        tracing::warn!("Restarting backend");

        match self.relaunch().await {
            Ok(port) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.set_state(BackendState::Ready);
                self.metrics.backend_restart(RestartOutcome::Success);
                tracing::info!(port = port, "Backend restarted");
            }
            Err(e) => {
                // keep ticking: a later attempt may succeed
                self.set_state(BackendState::Degraded);
                self.metrics.backend_restart(RestartOutcome::Failure);
                tracing::error!(critical = true, error = %e, "Backend restart failed");
            }
        }
    }

    async fn relaunch(&self) -> AppResult<u16> {
        let mut slot = self.handle.lock().await;
        if let Some(mut old) = slot.take() {
            old.stop().await;
        }

        tokio::time::sleep(self.config.port_release_delay()).await;

        let handle = self.launcher.launch().await?;
        let port = handle.port();
        *slot = Some(handle);
        drop(slot);

        let timeout = self.config.restart_startup_timeout();
        if wait_for_ready(self.probe.as_ref(), timeout).await {
            Ok(port)
        } else {
            Err(AppError::BackendNotReady {
                port,
                timeout_seconds: timeout.as_secs(),
            })
        }
    }
}
