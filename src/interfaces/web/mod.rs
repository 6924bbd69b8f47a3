pub(crate) mod auth;
mod handlers;
mod router;
mod ws;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use std::convert::Infallible;
use tokio::sync::broadcast;
use futures_util::StreamExt;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::hub::Hub;
use crate::core::lifecycle::LifecycleComponent;

pub use router::build_api_router;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) hub: Hub,
    pub(crate) log_tx: broadcast::Sender<String>,
    /// Cancelled when the server stops; ends long-lived streams.
    pub(crate) shutdown: CancellationToken,
}

impl AppState {
    pub(crate) fn new(hub: Hub, log_tx: broadcast::Sender<String>) -> Self {
        Self {
            hub,
            log_tx,
            shutdown: CancellationToken::new(),
        }
    }
}

/// HTTP and WebSocket front door. Binds on start and stops accepting on
/// shutdown.
pub struct ApiServer {
    state: AppState,
}

impl ApiServer {
    pub fn new(hub: Hub, log_tx: broadcast::Sender<String>) -> Self {
        Self {
            state: AppState::new(hub, log_tx),
        }
    }
}

// --- SSE Logs (used by router) ---

async fn sse_logs_endpoint(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.log_tx.subscribe();
    let stream = BroadcastStream::new(receiver)
        .map(|msg| match msg {
            Ok(line) => Ok(Event::default().data(line)),
            Err(_) => Ok(Event::default().data("Log stream lagged")),
        })
        .take_until(state.shutdown.cancelled_owned());

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[async_trait]
impl LifecycleComponent for ApiServer {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn on_start(&self) -> Result<()> {
        let config = self.state.hub.config.clone();
        let addr = format!("{}:{}", config.host, config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding API server to {}", addr))?;
        if config.api_token.is_none() && !config.is_loopback() {
            error!("No api_token configured; API requests on {} will be refused", addr);
        }

        let app = router::build_api_router(self.state.clone());
        let shutdown = self.state.shutdown.clone();
        self.state.hub.tracker.spawn(async move {
            info!("API Server running at http://{addr}");
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("API Server crashed: {}", e);
            }
        });
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        info!("API Server shutting down...");
        self.state.shutdown.cancel();
        Ok(())
    }
}
