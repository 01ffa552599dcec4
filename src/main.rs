//! ollama-proxy binary
//!
//! Starts the backend, serves the observing proxy, and shuts everything
//! down in order on Ctrl-C or SIGTERM.

use clap::Parser;
use ollama_proxy::{
    cli::{Cli, Command, generate_config_template},
    config::Config,
    lifecycle, telemetry,
};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Command::Config { output }) = &cli.command {
        return write_template(output.as_deref());
    }

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    telemetry::init(&config.observability.log_level);

    tracing::info!(
        proxy_port = config.server.port,
        backend_port = config.backend.port,
        managed = config.backend.manage_process,
        "Starting ollama-proxy"
    );

    match lifecycle::run(config, shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

fn write_template(output: Option<&str>) -> ExitCode {
    let template = generate_config_template();
    match output {
        Some(path) => match std::fs::write(path, template) {
            Ok(()) => {
                eprintln!("Wrote configuration template to {}", path);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: failed to write {}: {}", path, e);
                ExitCode::FAILURE
            }
        },
        None => {
            print!("{}", template);
            ExitCode::SUCCESS
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
