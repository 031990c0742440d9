//! wmux-worker: terminal multiplexer worker.
//!
//! Hosts PTY-backed shell sessions and serves them to viewers over
//! WebSocket. Viewers authenticate with a shared-secret token, then drive
//! sessions through tagged control messages and watch tagged events.

mod config;
mod exec;
mod server;
mod session;
mod transport;
mod worker;

use clap::Parser;
use config::WorkerConfig;
use server::WorkerServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use worker::Worker;

/// wmux-worker: terminal multiplexer worker
#[derive(Parser, Debug)]
#[command(name = "wmux-worker", version, about = "Terminal multiplexer worker")]
struct Cli {
    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Shared-secret auth token (also: WMUX_AUTH_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.config/wmux/worker.toml")]
    config: String,

    /// Print a freshly generated auth token and exit
    #[arg(long)]
    generate_token: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    if cli.generate_token {
        println!("{}", wmux_core::generate_token());
        return;
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting wmux-worker");

    // Load worker config (file + env + CLI overrides)
    let config_path = PathBuf::from(&cli.config);
    let worker_config = match WorkerConfig::load(
        Some(&config_path),
        cli.listen.as_deref(),
        cli.token.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let worker = Arc::new(Worker::new(&worker_config));
    let server = Arc::new(WorkerServer::new(Arc::clone(&worker), worker_config));

    // Run until shutdown signal
    tokio::select! {
        result = Arc::clone(&server).run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    // Tell viewers, then take the shells down cleanly.
    server.shutdown();
    worker.shutdown().await;
    info!("wmux-worker stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
