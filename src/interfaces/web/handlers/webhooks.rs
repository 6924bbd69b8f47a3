use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use serde_json::{Value, json};
use tracing::info;

use super::super::AppState;
use super::ApiResult;
use crate::core::tasks::{WebhookCall, WebhookOutcome};

/// `POST /hooks/{path}`. Public; a task secret is checked by the scheduler.
pub async fn webhook_endpoint(
    Path(path): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let call = WebhookCall {
        bearer: header("authorization")
            .and_then(|v| v.strip_prefix("Bearer ").map(|s| s.trim().to_string())),
        hub_signature: header("x-hub-signature-256"),
        signature: header("x-signature"),
        payload: parse_payload(&body),
        raw_body: body,
        path,
    };

    info!("Webhook received for path '{}'", call.path);
    match state.hub.tasks.deliver_webhook(call).await? {
        WebhookOutcome::Dispatched(dispatch) => Ok(Json(json!({
            "success": true,
            "status": "dispatched",
            "run": dispatch.run,
            "delivered_to": dispatch.delivered_to,
        }))),
        WebhookOutcome::Scheduled(event) => Ok(Json(json!({
            "success": true,
            "status": "scheduled",
            "event": event,
        }))),
    }
}

/// Empty bodies become `{}`; anything that is not JSON is wrapped as
/// `{"body": "<text>"}`.
fn parse_payload(body: &str) -> Value {
    if body.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(body).unwrap_or_else(|_| json!({ "body": body }))
}
