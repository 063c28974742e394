//! Server - axum router hosting the WebSocket hub and the status API

mod api;
pub mod hub;
mod ws;

pub use hub::WsHub;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::pipeline::Executor;
use crate::signals::SourceHandle;

/// Shared state for the request handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<WsHub>,
    pub executor: Arc<Executor>,
    pub sources: Arc<Vec<SourceHandle>>,
    pub started_at: DateTime<Utc>,
}

/// Serve the WebSocket endpoint and status API until `shutdown` resolves.
pub async fn serve(
    config: &Config,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/status", get(api::get_status))
        .route("/api/pipelines", get(api::get_pipelines))
        .route("/api/sources", get(api::get_sources))
        .with_state(state);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;
    Ok(())
}
