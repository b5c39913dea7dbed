//! Daemon wiring: channels, data socket, control socket, dispatcher and
//! shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use sensorhub_core::BufferRegistry;
use sensorhub_session::{MultiplexerConfig, SessionEvent, SessionMultiplexer};
use tokio::sync::mpsc;

use crate::channel;
use crate::cli::DaemonOpts;
use crate::config::HubConfig;
use crate::context::HubContext;
use crate::control;
use crate::dispatch::{self, WAKE_QUEUE_DEPTH};

/// Run the daemon until ctrl-c or SIGTERM.
pub async fn run_daemon(opts: DaemonOpts, control_socket: Option<PathBuf>) -> anyhow::Result<()> {
    let config = HubConfig::load(&opts.config)?;
    let data_socket = opts.data_socket.unwrap_or_else(|| config.socket_path.clone());
    let control_socket = control_socket.unwrap_or_else(|| config.control_socket_path.clone());

    let registry = Arc::new(BufferRegistry::new());
    let channels = config
        .channels
        .iter()
        .map(|c| channel::build(c, &registry))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let (multiplexer, mut session_events) = SessionMultiplexer::listen(
        &data_socket,
        MultiplexerConfig {
            preamble: bytes::Bytes::from(config.preamble.clone()),
            queue_depth: config.session_queue_depth,
            reclaim_timeout: config.reclaim_timeout(),
            ..MultiplexerConfig::default()
        },
    )
    .await
    .with_context(|| format!("cannot listen on {}", data_socket.display()))?;

    let (wake_tx, wake_rx) = mpsc::channel(WAKE_QUEUE_DEPTH);
    let ctx = Arc::new(HubContext::new(
        registry,
        channels,
        multiplexer,
        wake_tx,
        config.preamble.clone(),
        config.bind_timeout(),
    ));

    // Start control server
    let server_ctx = Arc::clone(&ctx);
    let server_socket = control_socket.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = control::run_control_server(&server_socket, server_ctx).await {
            tracing::error!("control server error: {e}");
        }
    });

    let dispatch_handle = tokio::spawn(dispatch::run_dispatcher(Arc::clone(&ctx), wake_rx));

    // Keep session bookkeeping in line with the data socket
    let events_ctx = Arc::clone(&ctx);
    let events_handle = tokio::spawn(async move {
        while let Some(event) = session_events.recv().await {
            match event {
                SessionEvent::Bound(id) => {
                    tracing::debug!(session = id, "client attached");
                    events_ctx.on_session_bound(id);
                }
                SessionEvent::Lost(id) => events_ctx.on_session_lost(id),
            }
        }
    });

    tracing::info!(
        data_socket = %ctx.multiplexer().path().display(),
        control_socket = %control_socket.display(),
        channels = ctx.list_channels().len(),
        "sensor hub running"
    );

    // Wait for shutdown signal (ctrl-c or SIGTERM)
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            tracing::info!("received ctrl-c, shutting down");
        }
    };

    tokio::select! {
        () = shutdown => {}
        _ = server_handle => {
            tracing::warn!("control server exited unexpectedly");
        }
        _ = dispatch_handle => {
            tracing::warn!("dispatcher exited unexpectedly");
        }
        _ = events_handle => {
            tracing::warn!("session event loop exited unexpectedly");
        }
    }

    // Release hardware and sockets
    ctx.shutdown();
    let _ = std::fs::remove_file(&control_socket);
    tracing::info!("daemon stopped");
    Ok(())
}
