mod registry;
mod server;
mod tools;

use anyhow::Context;
use daemonize_process::DaemonConfig;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = sigterm.recv() => Ok(()),
    }
}

#[tokio::main]
async fn main() {
    // stdout carries the protocol; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = DaemonConfig::from_env();
    tracing::info!(
        graceful_signal = config.graceful_signal.name(),
        grace_period_ms = config.grace_period.as_millis() as u64,
        log_max_lines = config.log_max_lines,
        "daemonize agent starting"
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => {
                    tracing::info!("shutdown signal received");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!(error = %e, "failed to install signal handlers"),
            }
        });
    }

    let handler = tools::DaemonizeMcp::new(registry::DaemonRegistry::new(config), shutdown.clone());
    let registry = handler.registry().clone();

    let (stdin, stdout) = rmcp::transport::stdio();
    let served = server::serve(stdin, stdout, handler, shutdown)
        .await
        .context("stdio server failed");
    if let Err(e) = &served {
        tracing::error!(error = %tools::format_error_chain(e), "server error");
    }

    registry.shutdown_all().await;
    tracing::info!("server stopped");

    // A blocking stdin read may still be pending and would hold the runtime open.
    std::process::exit(if served.is_ok() { 0 } else { 1 });
}
