//! plfm-vt tunnel
//!
//! Accepts client connections on one port, negotiates an upstream with the
//! configured protocol, and relays bytes until either side is done.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use plfm_tunnel::reverse::{ReverseForwarder, SshReverseForwarder};
use plfm_tunnel::{shutdown, Args, Config, Listener};

fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    // Keep the guard alive so queued log lines flush on exit.
    let _log_guard = plfm_tunnel::logging::init(&config.log_level, config.log_format)?;

    let runtime = if config.worker_count == 1 {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_count)
            .enable_all()
            .build()
    }
    .context("failed to build runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    info!("Starting plfm-vt tunnel");
    info!(
        bind_addr = %config.bind_addr(),
        protocol = %config.protocol,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        buffer_size = config.buffer_size,
        worker_count = config.worker_count,
        max_connections = config.max_connections,
        zero_copy = config.zero_copy,
        "Configuration loaded"
    );

    let listener = match Listener::from_config(&config) {
        Ok(listener) => Arc::new(listener),
        Err(e) => {
            error!(bind_addr = %config.bind_addr(), error = %e, "Failed to bind listener");
            return Err(e).context("failed to start listener");
        }
    };

    let forwarder = SshReverseForwarder::new();
    let reverse = match &config.reverse_tunnel {
        Some(spec) => match forwarder.start(spec).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Failed to start reverse tunnel, continuing without it");
                None
            }
        },
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let mut listener_task = tokio::spawn(Arc::clone(&listener).run(shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut listener_task => {
            match result {
                Ok(Ok(())) => info!("Listener exited"),
                Ok(Err(e)) => error!(error = %e, "Listener failed"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if !listener_task.is_finished() {
        match listener_task.await {
            Ok(Err(e)) => error!(error = %e, "Listener failed during shutdown"),
            Err(e) => error!(error = %e, "Listener task panicked"),
            Ok(Ok(())) => {}
        }
    }

    if let Some(handle) = reverse {
        if let Err(e) = forwarder.stop(handle).await {
            warn!(error = %e, "Failed to stop reverse tunnel");
        }
    }

    info!("Tunnel shutdown complete");
    Ok(())
}
