use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::AppState;
use crate::core::tasks::constant_time_eq;

pub async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let config = &state.hub.config;

    // No token configured: open access only on loopback (local dev)
    let Some(expected) = config.api_token.as_deref() else {
        if config.is_loopback() {
            return next.run(req).await;
        }
        return unauthorized(
            "No api_token configured. Set one in config.toml before exposing the API on a non-loopback address.",
        );
    };

    let presented = bearer_token(&req).or_else(|| {
        // Browsers cannot set headers on a WebSocket upgrade.
        if req.uri().path() == "/ws" {
            query_token(req.uri().query())
        } else {
            None
        }
    });

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => {
            next.run(req).await
        }
        Some(_) => unauthorized("Invalid API token"),
        None => unauthorized("Missing or invalid Authorization header. Use: Bearer <token>"),
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "success": false, "error": message })),
    )
        .into_response()
}

pub(crate) fn bearer_token<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

fn query_token(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}
