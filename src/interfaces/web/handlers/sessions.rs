use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde_json::json;

use super::super::AppState;
use super::{ApiResult, page_limit};
use crate::core::broadcast::ServerMessage;
use crate::core::error::HubError;
use crate::core::orchestrator::{Delivery, InboundMessage};
use crate::core::store::{DbEnum, MailboxStatus};
use crate::core::tasks::is_valid_webhook_path;

pub async fn list_sessions(State(state): State<AppState>) -> ApiResult {
    let sessions = state.hub.store.list_sessions().await?;
    Ok(Json(json!({
        "success": true,
        "sessions": sessions,
        "active": state.hub.orchestrator.active_sessions(),
    })))
}

#[derive(serde::Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    name: String,
    working_dir: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<CreateSessionRequest>,
) -> ApiResult {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(HubError::validation("name is required"));
    }
    let working_dir = match payload.working_dir.as_deref().map(str::trim) {
        Some(dir) if !dir.is_empty() => {
            if !std::path::Path::new(dir).is_dir() {
                return Err(HubError::validation(format!(
                    "working_dir '{}' is not a directory",
                    dir
                )));
            }
            dir.to_string()
        }
        _ => state.hub.config.working_dir().to_string_lossy().to_string(),
    };

    let session = state.hub.store.create_session(name, &working_dir).await?;
    Ok(Json(json!({ "success": true, "session": session })))
}

pub async fn get_session(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    let session = state.hub.store.require_session(&id).await?;
    Ok(Json(json!({
        "success": true,
        "session": session,
        "busy": state.hub.orchestrator.is_active(&id),
    })))
}

#[derive(serde::Deserialize)]
pub struct RenameSessionRequest {
    #[serde(default)]
    name: String,
}

pub async fn rename_session(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<RenameSessionRequest>,
) -> ApiResult {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(HubError::validation("name is required"));
    }
    if !state.hub.store.rename_session(&id, name).await? {
        return Err(HubError::not_found(format!("session {}", id)));
    }
    state.hub.broadcast.broadcast_global(ServerMessage::SessionRenamed {
        session_id: id.clone(),
        name: name.to_string(),
    });
    let session = state.hub.store.require_session(&id).await?;
    Ok(Json(json!({ "success": true, "session": session })))
}

pub async fn delete_session(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    if state.hub.orchestrator.is_active(&id) {
        return Err(HubError::conflict(
            "session has an active invocation; interrupt it first",
        ));
    }
    if !state.hub.store.delete_session(&id).await? {
        return Err(HubError::not_found(format!("session {}", id)));
    }
    Ok(Json(json!({ "success": true })))
}

#[derive(serde::Deserialize)]
pub struct EventsQuery {
    after: Option<i64>,
    limit: Option<usize>,
}

pub async fn list_events(
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    state.hub.store.require_session(&id).await?;
    let events = state
        .hub
        .store
        .list_stream_events(&id, query.after, page_limit(query.limit))
        .await?;
    Ok(Json(json!({ "success": true, "events": events })))
}

#[derive(serde::Deserialize)]
pub struct MailboxQuery {
    status: Option<String>,
}

pub async fn list_mailbox(
    Path(id): Path<String>,
    Query(query): Query<MailboxQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            MailboxStatus::parse(raw)
                .ok_or_else(|| HubError::validation(format!("unknown mailbox status '{}'", raw)))?,
        ),
        None => None,
    };
    state.hub.store.require_session(&id).await?;
    let entries = state.hub.store.list_mailbox(&id, status).await?;
    Ok(Json(json!({ "success": true, "entries": entries })))
}

#[derive(serde::Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    content: String,
}

/// Chat into a session: starts an invocation when idle, queues otherwise.
pub async fn send_message(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<SendMessageRequest>,
) -> ApiResult {
    if payload.content.trim().is_empty() {
        return Err(HubError::validation("content is required"));
    }
    let delivery = state
        .hub
        .orchestrator
        .deliver(InboundMessage::chat(&id, &payload.content))
        .await?;

    let mut body = json!({ "success": true, "status": delivery.status() });
    if let Delivery::Queued(entry) = &delivery {
        body["entry"] = serde_json::to_value(entry)?;
    }
    Ok(Json(body))
}

pub async fn interrupt_session(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    state.hub.store.require_session(&id).await?;
    let interrupted = state.hub.orchestrator.interrupt(&id);
    Ok(Json(json!({ "success": true, "interrupted": interrupted })))
}

#[derive(serde::Deserialize)]
pub struct WatchRequest {
    #[serde(default)]
    target: String,
}

/// Session `id` is notified once when `target` next finishes.
pub async fn watch_session(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<WatchRequest>,
) -> ApiResult {
    if payload.target.trim().is_empty() {
        return Err(HubError::validation("target is required"));
    }
    state.hub.orchestrator.watch(&id, payload.target.trim()).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn list_subscriptions(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> ApiResult {
    state.hub.store.require_session(&id).await?;
    let subscriptions = state.hub.store.list_webhook_subscriptions(&id).await?;
    Ok(Json(json!({ "success": true, "subscriptions": subscriptions })))
}

#[derive(serde::Deserialize)]
pub struct SubscribeRequest {
    #[serde(default)]
    path: String,
}

pub async fn add_subscription(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<SubscribeRequest>,
) -> ApiResult {
    let path = payload.path.trim();
    if !is_valid_webhook_path(path) {
        return Err(HubError::validation(
            "path must be 1-128 characters of [A-Za-z0-9_-]",
        ));
    }
    state.hub.store.require_session(&id).await?;
    state.hub.store.add_webhook_subscription(&id, path).await?;
    Ok(Json(json!({ "success": true, "path": path })))
}

pub async fn remove_subscription(
    Path((id, path)): Path<(String, String)>,
    State(state): State<AppState>,
) -> ApiResult {
    if !state.hub.store.remove_webhook_subscription(&id, &path).await? {
        return Err(HubError::not_found(format!("subscription {} of session {}", path, id)));
    }
    Ok(Json(json!({ "success": true })))
}
