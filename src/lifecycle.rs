//! Ordered startup and shutdown
//!
//! Startup: check ports, start the backend, wait until it answers, open the
//! analytics store, bind the listener, start serving, start the health
//! supervisor.
//!
//! Shutdown runs in strict reverse: the supervisor stops first so it cannot
//! mistake the deliberate backend stop for a crash; the listener drains
//! in-flight requests for up to the grace period; the backend is stopped; the
//! analytics queue is flushed last so no observation made during the drain
//! is lost.
//!
//! Forwarding outlives the connection that started it, so after the listener
//! is down the pipeline's unreported requests are awaited as well. Stopping
//! the backend ends any stream still stuck on it, which reports it.

use crate::analytics::Analytics;
use crate::backend::{HttpProbe, ProcessLauncher, Supervisor, ensure_port_free, wait_for_ready};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::handlers::{AppState, router};
use crate::metrics::Metrics;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Extra wait for unreported requests once the backend has been stopped
const REPORT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// A started proxy
pub struct RunningProxy {
    local_addr: SocketAddr,
    state: AppState,
    supervisor: Option<Supervisor>,
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
    grace: Duration,
}

impl RunningProxy {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    /// Whether the HTTP server task has exited on its own
    pub fn server_finished(&self) -> bool {
        self.server.is_finished()
    }

    /// Run the shutdown sequence
    pub async fn shutdown(self) {
        tracing::info!("Shutting down");

        if let Some(supervisor) = &self.supervisor {
            supervisor.stop_monitor().await;
        }

        self.shutdown.cancel();
        let mut server = self.server;
        match tokio::time::timeout(self.grace, &mut server).await {
            Ok(Ok(Ok(()))) => tracing::info!("HTTP server drained"),
            Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server failed"),
            Ok(Err(e)) => tracing::error!(error = %e, "HTTP server task ended abnormally"),
            Err(_) => {
                tracing::warn!(
                    grace_seconds = self.grace.as_secs(),
                    in_flight = self.state.pipeline().admission().in_flight(),
                    "Grace period elapsed, closing remaining connections"
                );
                server.abort();
                let _ = server.await;
            }
        }

        let pipeline = self.state.pipeline();
        let mut reported = pipeline.drain(self.grace).await;

        if let Some(supervisor) = &self.supervisor {
            supervisor.stop_backend().await;
        }

        if !reported {
            reported = pipeline.drain(REPORT_FLUSH_TIMEOUT).await;
        }
        if !reported {
            tracing::warn!(
                unreported = pipeline.unreported(),
                "Closing analytics with requests still unreported"
            );
        }

        self.state.analytics().close().await;
        tracing::info!("Shutdown complete");
    }
}

/// Bring the proxy up
///
/// # Errors
///
/// Startup failures (`PortInUse`, `BackendLaunch`, `BackendNotReady`,
/// `ListenerBind`) are fatal; whatever was already started is torn down
/// before the error is returned.
pub async fn start(config: Config) -> AppResult<RunningProxy> {
    let config = Arc::new(config);
    let managed = config.backend.manage_process;

    ensure_port_free(&config.server.host, config.server.port).await?;
    if managed {
        ensure_port_free(&config.backend.host, config.backend.port).await?;
    }

    let metrics = Arc::new(Metrics::new().map_err(|e| {
        AppError::Internal(format!("Failed to initialize metrics registry: {}", e))
    })?);
    let probe = Arc::new(HttpProbe::new(
        &config.backend.base_url(),
        config.health.probe_timeout(),
    )?);

    let supervisor = if managed {
        let supervisor = Supervisor::new(
            Arc::new(ProcessLauncher::new(&config.backend)),
            probe,
            config.health.clone(),
            metrics.clone(),
        );
        if let Err(e) = supervisor.start_backend(config.backend.startup_timeout()).await {
            supervisor.stop_backend().await;
            return Err(e);
        }
        Some(supervisor)
    } else {
        if !wait_for_ready(probe.as_ref(), Duration::ZERO).await {
            tracing::warn!(
                backend = %config.backend.base_url(),
                "External backend is not answering yet; requests will fail until it does"
            );
        }
        None
    };

    let analytics = Analytics::open(&config.analytics);
    let shutdown = CancellationToken::new();

    let bound = bind(&config).await;
    let state = AppState::new(config.clone(), metrics, analytics.clone(), shutdown.clone());
    let (listener, state) = match (bound, state) {
        (Ok(listener), Ok(state)) => (listener, state),
        (Err(e), _) | (_, Err(e)) => {
            if let Some(supervisor) = &supervisor {
                supervisor.stop_backend().await;
            }
            analytics.close().await;
            return Err(e);
        }
    };

    let local_addr = listener.local_addr().map_err(|e| AppError::ListenerBind {
        addr: format!("{}:{}", config.server.host, config.server.port),
        source: e,
    })?;

    let app = router(state.clone());
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned());
    let server = tokio::spawn(async move { serve.await });

    tracing::info!(
        addr = %local_addr,
        backend = %config.backend.base_url(),
        "Proxy listening"
    );
    tracing::info!("Metrics at http://{}/metrics", local_addr);
    tracing::info!("Analytics at http://{}/analytics/stats", local_addr);

    if let Some(supervisor) = &supervisor {
        if config.health.enabled {
            supervisor.spawn_monitor();
        }
    }

    Ok(RunningProxy {
        local_addr,
        state,
        supervisor,
        shutdown,
        server,
        grace: Duration::from_secs(config.server.shutdown_grace_seconds),
    })
}

async fn bind(config: &Config) -> AppResult<TcpListener> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| AppError::ListenerBind { addr, source })
}

/// Start, serve until `signal` resolves, then shut down in order
pub async fn run<F>(config: Config, signal: F) -> AppResult<()>
where
    F: Future<Output = ()> + Send,
{
    let proxy = start(config).await?;
    signal.await;
    proxy.shutdown().await;
    Ok(())
}
