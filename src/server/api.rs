// Read-only status endpoints
//
// The HTTP surface is intentionally small: the engine is driven by its
// pipeline store and the WebSocket protocol, these endpoints only expose
// snapshots for dashboards and debugging. Pipeline CRUD lives elsewhere.

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use super::AppState;

/// GET /api/status - engine-wide snapshot, same shape as the periodic
/// `system` channel broadcast
pub async fn get_status(State(state): State<AppState>) -> Json<Value> {
    Json(state.system_status())
}

/// GET /api/pipelines - status of every loaded pipeline
pub async fn get_pipelines(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "pipelines": state.executor.all_pipelines(),
    }))
}

/// GET /api/sources - per-source status and last observed values
pub async fn get_sources(State(state): State<AppState>) -> Json<Value> {
    let sources: Vec<Value> = state
        .sources
        .iter()
        .map(|handle| serde_json::to_value(handle.status()).unwrap_or(Value::Null))
        .collect();
    Json(json!({"sources": sources}))
}

impl AppState {
    /// Snapshot used by both /api/status and the system channel broadcast.
    pub fn system_status(&self) -> Value {
        json!({
            "uptime_seconds": (Utc::now() - self.started_at).num_seconds(),
            "pipelines_loaded": self.executor.pipeline_count(),
            "sources_running": self
                .sources
                .iter()
                .filter(|handle| handle.is_running())
                .count(),
            "sources_total": self.sources.len(),
            "clients_connected": self.hub.connection_count(),
        })
    }
}
