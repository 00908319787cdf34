use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tunnel_relay::{reaper::spawn_reaper, router, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_relay=info".into()),
        )
        .init();

    let config = Config::parse();
    let shutdown = CancellationToken::new();

    let state = AppState::new(&config, shutdown.clone());
    let reaper = spawn_reaper(
        state.engine.registry().clone(),
        config.reap_interval(),
        shutdown.clone(),
    );

    let addr = config.socket_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(
        poll_timeout_secs = config.poll_timeout_secs,
        reap_interval_secs = config.reap_interval_secs,
        "Tunnel relay listening on {}",
        addr
    );
    // Readiness marker for process supervisors that watch stdout
    println!("SERVER_READY");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = reaper.await;
    info!("Tunnel relay stopped");
    Ok(())
}

/// Resolves on Ctrl-C and cancels `shutdown`, which answers every pending
/// long poll so the graceful shutdown does not wait out their deadlines.
async fn shutdown_signal(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until the process is killed.
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    shutdown.cancel();
}
