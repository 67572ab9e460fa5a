//! protho: forward TCP connections or UDP datagrams to a fixed upstream

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use protho::config::{CliArgs, RelayConfig};
use protho::core::Relay;
use protho::logger::{self, log, LogLevel};
use protho::server_runner;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = CliArgs::parse_args();

    let config = RelayConfig::from_cli(&cli)?;

    // Initialize logger
    logger::init_logger(LogLevel::resolve(&cli.log_mode, config.verbose));

    log::info!(
        transport = %config.transport,
        listen = %config.listen,
        upstream = %config.upstream,
        "Starting relay"
    );

    let relay = Arc::new(Relay::new(config)?);
    if !relay.pipeline.is_empty() {
        log::info!(rules = relay.pipeline.rule_count(), "Filter rules loaded");
    }

    // Create cancellation token for graceful shutdown
    let shutdown = CancellationToken::new();
    let shutdown_trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown_trigger.cancel();
    });

    if let Err(e) = server_runner::run(relay, shutdown).await {
        if e.is_policy_error() {
            log::error!(error = %e, "Strict mode: terminating on connection error");
        } else {
            log::error!(error = %e, "Relay failed");
        }
        std::process::exit(1);
    }

    log::info!("Relay stopped");
    Ok(())
}

/// Resolve on SIGINT/SIGTERM (Ctrl-C elsewhere)
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigint, mut sigterm) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
            (Err(e), _) | (_, Err(e)) => {
                log::warn!(error = %e, "Failed to install signal handlers, falling back to Ctrl-C");
                tokio::signal::ctrl_c().await.ok();
                log::info!("Shutdown signal received...");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                log::info!("SIGINT received, shutting down...");
            }
            _ = sigterm.recv() => {
                log::info!("SIGTERM received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        log::info!("Shutdown signal received...");
    }
}
