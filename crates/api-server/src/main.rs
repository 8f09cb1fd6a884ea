//! API Server for Runwatch
//!
//! Serves the session control API and the live event streams (SSE and
//! WebSocket) on one port.

mod config;
mod routes;
mod state;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "api_server=debug,agent_runner=info,runwatch_core=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        archive = config.archive,
        "Starting runwatch server"
    );

    let app_state = AppState::new(&config);
    if config.archive {
        let recovery = app_state.registry().recover();
        for (session_id, error) in &recovery.errors {
            tracing::warn!(session_id = %session_id, "Failed to recover session: {}", error);
        }
    }

    let shutdown = CancellationToken::new();
    let sweeper = agent_runner::start_sweeper(
        app_state.registry().clone(),
        config.sweep(),
        shutdown.clone(),
    );

    let app = routes::app(app_state);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;
    tracing::info!("Listening on {}", config.addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}
