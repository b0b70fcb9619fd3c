//! WebSocket server for the agent-host orchestrator (axum + ws, spec §6).
//!
//! Builds the process-wide [`deps::Runtime`] once and serves the `/ws`
//! upgrade endpoint; every accepted connection shares the same router,
//! connection manager, and rate limiter.
//!
//! **Public API**: [`run_serve`], [`run_serve_on_listener`].

mod app;
mod commands;
mod connection;
mod deps;
mod storage;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use app::{router, AppState};

const DEFAULT_WS_ADDR: &str = "127.0.0.1:8080";

/// Runs the WebSocket server on an existing listener. Used by tests (bind to
/// `127.0.0.1:0` then pass the listener in).
pub async fn run_serve_on_listener(listener: TcpListener, config: config::AppConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = listener.local_addr()?;
    info!("WebSocket server listening on ws://{}/ws", addr);

    let runtime = deps::build_runtime(config);
    let state = Arc::new(AppState::from(runtime));
    let app = router(state);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs the WebSocket server. Listens on `addr` (default `127.0.0.1:8080`).
pub async fn run_serve(addr: Option<&str>, config: config::AppConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = addr.unwrap_or(DEFAULT_WS_ADDR);
    let listener = TcpListener::bind(addr).await?;
    run_serve_on_listener(listener, config).await
}
