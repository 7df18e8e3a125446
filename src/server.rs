//! Server bootstrap: state wiring, router assembly, and the serve loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{extract::DefaultBodyLimit, Router};
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState};
use crate::config::ServerConfig;
use crate::hub::Monitor;
use crate::stream::StreamLimiter;
use crate::tokens::TokenIssuer;

/// Build the shared state for one server instance.
pub fn build_state(config: ServerConfig) -> Arc<AppState> {
    let monitor = Arc::new(Monitor::new(config.daemon_stale_after, config.event_capacity));
    let tokens = Arc::new(TokenIssuer::new(
        config.token_ttl,
        config.max_tokens_per_user,
    ));
    let stream_limiter = StreamLimiter::new(config.max_stream_connections);
    Arc::new(AppState {
        monitor,
        tokens,
        stream_limiter,
        config,
    })
}

/// Assemble the application router. The body-size ceiling applies to every
/// route, so an oversized payload is rejected before any handler runs.
pub fn build_router(state: Arc<AppState>) -> Router {
    let max_body_bytes = state.config.max_body_bytes;
    let dev_mode = state.config.dev_mode;

    let mut app = api::api_router()
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(state);

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the monitoring server and block until shutdown.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let state = build_state(config);

    // The sweep keeps abandoned tokens from accumulating; it runs on the
    // runtime timer, never on a request path.
    let sweeper = state
        .tokens
        .spawn_sweeper(state.config.token_sweep_interval);

    let host = if state.config.dev_mode {
        "0.0.0.0"
    } else {
        "127.0.0.1"
    };
    let addr = format!("{}:{}", host, state.config.port);
    let app = build_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "monitor server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweeper.abort();
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    tracing::info!("shutdown signal received");
}
