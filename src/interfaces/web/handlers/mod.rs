pub mod events;
pub mod sessions;
pub mod tasks;
pub mod webhooks;

use axum::{Json, extract::State};
use serde_json::Value;

use super::AppState;
use crate::core::error::HubError;

pub type ApiResult = Result<Json<Value>, HubError>;

const DEFAULT_PAGE: usize = 200;
const MAX_PAGE: usize = 1000;

/// Clamp a caller-supplied `limit` query parameter.
pub(crate) fn page_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE)
}

pub async fn health_endpoint(State(state): State<AppState>) -> Json<Value> {
    let hub = &state.hub;
    Json(serde_json::json!({
        "success": true,
        "service": "agentbox",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": hub.orchestrator.active_sessions().len(),
        "listeners": hub.broadcast.listener_count(),
        "cron_timers": hub.tasks.timer_count().await,
    }))
}
