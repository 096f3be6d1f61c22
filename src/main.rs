//! frame-echo: length-prefixed echo server and load-generating client
//!
//! `frame-echo server [PORT]` echoes every valid frame back to its sender.
//! `frame-echo client` opens many connections against a server, verifies
//! each echo and reports throughput and latency.

use frame_echo::client::EchoClient;
use frame_echo::config::{ClientConfig, Config, Mode, ServerConfig};
use frame_echo::runtime::{self, EchoServer};
use frame_echo::stats::Stats;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    runtime::raise_fd_limit();

    match config.mode {
        Mode::Server(server) => run_server(server),
        Mode::Client(client) => run_client(client),
    }
}

/// Run the mio echo server until Ctrl-C.
fn run_server(config: ServerConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_count(),
        max_payload = config.max_payload,
        "Starting echo server"
    );

    let stats = Arc::new(Stats::new());
    let server = match EchoServer::bind(config, stats) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Failed to start server");
            return Ok(ExitCode::FAILURE);
        }
    };

    let handle = server.shutdown_handle();
    thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    warn!(error = %e, "Signal handler unavailable");
                    return;
                }
            };
            match rt.block_on(tokio::signal::ctrl_c()) {
                Ok(()) => {
                    info!("Shutdown requested");
                    handle.shutdown();
                }
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
            }
        })?;

    server.run()?;
    Ok(ExitCode::SUCCESS)
}

/// Run the load client; exit code 1 if any error was counted.
fn run_client(config: ClientConfig) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let report = rt.block_on(async move {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Cancelling load test");
                let _ = cancel_tx.send(true);
            }
        });

        let client = EchoClient::new(config, Arc::new(Stats::new()));
        client.run(cancel_rx).await
    });

    report.log();
    if report.totals.errors > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
