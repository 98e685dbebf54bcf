//! Process lifecycle: serve until a shutdown signal, then drain.
//!
//! `SIGINT` or `SIGTERM` stops the listener from accepting, runs the
//! registered shutdown hooks, and gives in-flight requests a bounded amount
//! of time to complete. Exceeding the deadline is its own reported failure,
//! distinct from a startup error. A failure to bind still runs the hooks
//! before returning.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::pin::pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::Router;
use tokio::signal;
use tracing::info;

use crate::config::ServerConfig;

/// Callback run once during shutdown, before waiting for the drain.
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Serve
// ---------------------------------------------------------------------------

pub async fn serve(cfg: &ServerConfig, app: Router, hooks: Vec<ShutdownHook>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            run_hooks(hooks);
            return Err(err).with_context(|| format!("failed to bind listener on {addr}"));
        }
    };

    info!(%addr, "server listening");

    let (signal_tx, mut signal_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let mut server = pin!(axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let mut signal_rx = signal_rx.clone();
        async move {
            let _ = signal_rx.wait_for(|fired| *fired).await;
        }
    })
    .into_future());

    tokio::select! {
        result = &mut server => {
            // the listener failed before any signal; shut down regardless
            run_hooks(hooks);
            return result.context("server error");
        }
        _ = signal_rx.wait_for(|fired| *fired) => {
            info!("server shutdown requested");
        }
    }

    run_hooks(hooks);

    let deadline = Duration::from_secs(cfg.shutdown_timeout_secs);
    match tokio::time::timeout(deadline, server).await {
        Ok(result) => {
            result.context("server error during shutdown")?;
            info!("server shutdown complete");
            Ok(())
        }
        Err(_) => bail!(
            "server shutdown deadline of {}s exceeded",
            cfg.shutdown_timeout_secs
        ),
    }
}

fn run_hooks(hooks: Vec<ShutdownHook>) {
    for hook in hooks {
        hook();
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
