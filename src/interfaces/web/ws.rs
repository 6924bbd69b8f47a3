use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use super::AppState;
use crate::core::broadcast::{Outbound, ServerMessage};
use crate::core::error::{HubError, HubResult};
use crate::core::orchestrator::InboundMessage;

/// Commands a listener may send, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Tune {
        #[serde(default)]
        session_id: Option<String>,
    },
    Submit {
        session_id: String,
        content: String,
    },
    Interrupt {
        session_id: String,
    },
    Watch {
        subscriber: String,
        target: String,
    },
}

pub async fn ws_endpoint(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let router = state.hub.broadcast.clone();
    let (id, mut outbound) = router.register();
    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let closing = matches!(frame, Outbound::Close { .. });
            let Some(message) = to_ws_message(frame) else {
                continue;
            };
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = async {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    let result = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                        Ok(command) => handle_command(&state, id, command).await,
                        Err(e) => Err(HubError::validation(format!("invalid command: {}", e))),
                    };
                    if let Err(e) = result {
                        router.send_to(id, ServerMessage::Error { message: e.to_string() });
                    }
                }
                Message::Pong(_) => router.ack_pong(id),
                Message::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = &mut writer => {}
        _ = reader => {}
    }
    router.unregister(id);
    writer.abort();
    debug!("WebSocket listener {} closed", id);
}

pub(crate) async fn handle_command(
    state: &AppState,
    listener: u64,
    command: ClientMessage,
) -> HubResult<()> {
    let hub = &state.hub;
    match command {
        ClientMessage::Tune { session_id } => {
            if let Some(session_id) = &session_id {
                hub.store.require_session(session_id).await?;
            }
            hub.broadcast.tune(listener, session_id);
        }
        ClientMessage::Submit {
            session_id,
            content,
        } => {
            if content.trim().is_empty() {
                return Err(HubError::validation("content is required"));
            }
            let delivery = hub
                .orchestrator
                .deliver(InboundMessage::chat(&session_id, &content))
                .await?;
            debug!("Listener {} submit to {}: {}", listener, session_id, delivery.status());
        }
        ClientMessage::Interrupt { session_id } => {
            if !hub.orchestrator.interrupt(&session_id) {
                debug!("Listener {} interrupt of idle session {}", listener, session_id);
            }
        }
        ClientMessage::Watch { subscriber, target } => {
            hub.orchestrator.watch(&subscriber, &target).await?;
        }
    }
    Ok(())
}

fn to_ws_message(frame: Outbound) -> Option<Message> {
    match frame {
        Outbound::Message(message) => match serde_json::to_string(&message) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                warn!("Dropping unserializable listener message: {}", e);
                None
            }
        },
        Outbound::Ping => Some(Message::Ping(Default::default())),
        Outbound::Close { code, reason } => Some(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        }))),
    }
}
