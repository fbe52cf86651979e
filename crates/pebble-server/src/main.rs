use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod telemetry;

use config::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.resolve()?;
    telemetry::init(settings.log_json)?;

    info!("Pebble server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = settings.server;
    let tls_acceptor = pebble_xmpp::load_tls_acceptor(&config.tls_cert_path, &config.tls_key_path)
        .context("Failed to load TLS credentials")?;

    let listener = TcpListener::bind(config.c2s_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.c2s_addr))?;
    info!(addr = %listener.local_addr()?, domain = %config.domain, "Listening for client connections");

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    pebble_xmpp::start(config, tls_acceptor, listener, shutdown)
        .await
        .context("XMPP server failed")?;

    info!("Pebble server stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                return;
            }
            info!("Received Ctrl-C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }

    shutdown.cancel();
}
