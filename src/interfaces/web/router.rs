use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{self, events, sessions, tasks, webhooks};
use super::ws;

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // Webhook callers authenticate with the task secret, not the API token
    let public_routes = Router::new()
        .route("/api/health", get(handlers::health_endpoint))
        .route("/hooks/{path}", post(webhooks::webhook_endpoint))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route(
            "/api/sessions",
            get(sessions::list_sessions).post(sessions::create_session),
        )
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session)
                .patch(sessions::rename_session)
                .delete(sessions::delete_session),
        )
        .route("/api/sessions/{id}/events", get(sessions::list_events))
        .route("/api/sessions/{id}/mailbox", get(sessions::list_mailbox))
        .route("/api/sessions/{id}/messages", post(sessions::send_message))
        .route(
            "/api/sessions/{id}/interrupt",
            post(sessions::interrupt_session),
        )
        .route("/api/sessions/{id}/watch", post(sessions::watch_session))
        .route(
            "/api/sessions/{id}/subscriptions",
            get(sessions::list_subscriptions).post(sessions::add_subscription),
        )
        .route(
            "/api/sessions/{id}/subscriptions/{path}",
            delete(sessions::remove_subscription),
        )
        .route("/api/tasks", get(tasks::list_tasks).post(tasks::create_task))
        .route(
            "/api/tasks/{id}",
            get(tasks::get_task)
                .patch(tasks::update_task)
                .delete(tasks::delete_task),
        )
        .route("/api/tasks/{id}/run", post(tasks::run_task))
        .route("/api/tasks/{id}/runs", get(tasks::list_runs))
        .route(
            "/api/events",
            get(events::list_events).post(events::create_event),
        )
        .route(
            "/api/events/{id}",
            get(events::get_event)
                .patch(events::update_event)
                .delete(events::cancel_event),
        )
        .route("/api/logs", get(super::sse_logs_endpoint))
        .route("/ws", get(ws::ws_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.hub.config.port))
        .with_state(state.clone());

    public_routes.merge(authed_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}
