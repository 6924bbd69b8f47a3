use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde_json::json;

use super::super::AppState;
use super::{ApiResult, page_limit};
use crate::core::error::HubError;
use crate::core::scheduled::{EventDraft, EventPatch};
use crate::core::store::{DbEnum, EventStatus};

#[derive(serde::Deserialize)]
pub struct EventsQuery {
    status: Option<String>,
    limit: Option<usize>,
}

pub async fn list_events(
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            EventStatus::parse(raw)
                .ok_or_else(|| HubError::validation(format!("unknown event status '{}'", raw)))?,
        ),
        None => None,
    };
    let events = state.hub.events.list(status, page_limit(query.limit)).await?;
    Ok(Json(json!({ "success": true, "events": events })))
}

pub async fn create_event(
    State(state): State<AppState>,
    Json(draft): Json<EventDraft>,
) -> ApiResult {
    let event = state.hub.events.create(draft).await?;
    Ok(Json(json!({ "success": true, "event": event })))
}

pub async fn get_event(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    let event = state.hub.events.get(&id).await?;
    Ok(Json(json!({ "success": true, "event": event })))
}

pub async fn update_event(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(patch): Json<EventPatch>,
) -> ApiResult {
    let event = state.hub.events.update(&id, patch).await?;
    Ok(Json(json!({ "success": true, "event": event })))
}

pub async fn cancel_event(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    let event = state.hub.events.cancel(&id).await?;
    Ok(Json(json!({ "success": true, "event": event })))
}
