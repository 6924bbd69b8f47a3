use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::registry::Reservation;
use super::{Orchestrator, QueryHandle};
use crate::core::agent::InvokeOptions;
use crate::core::broadcast::ServerMessage;
use crate::core::error::HubResult;
use crate::core::store::{DbEnum, MailboxEntry, MailboxKind, MailboxStatus, StreamEventKind};

/// Content headed for a session from a user, a webhook, a watch or the hub.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub session_id: String,
    pub kind: MailboxKind,
    pub content: String,
    pub metadata: Value,
}

impl InboundMessage {
    pub fn chat(session_id: &str, content: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            kind: MailboxKind::Chat,
            content: content.to_string(),
            metadata: json!({}),
        }
    }
}

pub enum Delivery {
    /// The session was idle; an invocation started right away.
    Started(QueryHandle),
    /// The session was busy; the message waits in its mailbox.
    Queued(MailboxEntry),
    /// An identical chat message was recorded moments ago.
    Duplicate,
}

impl Delivery {
    pub fn status(&self) -> &'static str {
        match self {
            Delivery::Started(_) => "started",
            Delivery::Queued(_) => "queued",
            Delivery::Duplicate => "duplicate",
        }
    }
}

impl Orchestrator {
    /// Run the message now if the session is idle, otherwise queue it.
    pub async fn deliver(self: &Arc<Self>, message: InboundMessage) -> HubResult<Delivery> {
        let session = self.store.require_session(&message.session_id).await?;

        if message.kind == MailboxKind::Chat
            && self.is_duplicate(&session.id, &message.content).await?
        {
            debug!("Dropping duplicate chat message for session {}", session.id);
            return Ok(Delivery::Duplicate);
        }

        if !self.is_shutting_down()
            && let Some(reservation) = self.active.reserve(&session.id)
        {
            let waiting = match self.store.has_pending_mail(&session.id).await {
                Ok(waiting) => waiting,
                Err(e) => {
                    self.active.release(&session.id, reservation.generation);
                    return Err(e);
                }
            };
            if !waiting {
                if message.kind == MailboxKind::Chat {
                    self.record_user_message(&session.id, &message.content, &message.metadata)
                        .await;
                }
                let handle = self
                    .start(session, reservation, message.content, InvokeOptions::default())
                    .await?;
                return Ok(Delivery::Started(handle));
            }
            // Older entries are still waiting; this one lines up behind them.
            self.active.release(&session.id, reservation.generation);
        }

        let entry = self
            .store
            .push_mailbox_entry(
                &session.id,
                message.kind,
                &message.content,
                &message.metadata,
            )
            .await?;
        self.broadcast.broadcast_session(
            &session.id,
            ServerMessage::MessageQueued {
                session_id: session.id.clone(),
                entry_id: entry.id,
            },
        );
        info!(
            "Queued {} message {} for session {}",
            message.kind.as_str(),
            entry.id,
            session.id
        );

        // The invocation may have finished between the reservation check and
        // the insert, in which case nobody else will drain this entry.
        if !self.active.is_active(&session.id) {
            self.drain_mailbox(&session.id).await;
        }
        Ok(Delivery::Queued(entry))
    }

    /// Start the oldest pending entry if the session is idle. Entries that
    /// fail to start are marked failed and the next one is tried.
    /// Returns whether an invocation was started.
    pub async fn drain_mailbox(self: &Arc<Self>, session_id: &str) -> bool {
        self.drain_from(session_id, None).await
    }

    /// Drain starting with a slot the caller may already hold. A held slot
    /// is used for the oldest entry or released.
    pub(super) async fn drain_from(
        self: &Arc<Self>,
        session_id: &str,
        mut held: Option<Reservation>,
    ) -> bool {
        loop {
            if self.is_shutting_down() {
                if let Some(reservation) = held.take() {
                    self.active.release(session_id, reservation.generation);
                }
                return false;
            }
            let reservation = match held.take() {
                Some(reservation) => reservation,
                None => {
                    // Checked before reserving so that an empty mailbox never
                    // holds the slot, not even briefly.
                    match self.store.has_pending_mail(session_id).await {
                        Ok(true) => {}
                        Ok(false) => return false,
                        Err(e) => {
                            warn!("Failed to check mailbox of {}: {}", session_id, e);
                            return false;
                        }
                    }
                    let Some(reservation) = self.active.reserve(session_id) else {
                        return false;
                    };
                    reservation
                }
            };

            let entry = match self.store.claim_next_mailbox_entry(session_id).await {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    // Claimed elsewhere; re-check in case more arrived meanwhile.
                    self.active.release(session_id, reservation.generation);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to claim mailbox entry for {}: {}", session_id, e);
                    self.active.release(session_id, reservation.generation);
                    return false;
                }
            };

            let session = match self.store.require_session(session_id).await {
                Ok(session) => session,
                Err(e) => {
                    self.active.release(session_id, reservation.generation);
                    self.fail_entry(&entry, &e.to_string()).await;
                    continue;
                }
            };

            if entry.kind == MailboxKind::Chat {
                self.record_user_message(session_id, &entry.content, &entry.metadata)
                    .await;
            }
            match self
                .start(session, reservation, entry.content.clone(), InvokeOptions::default())
                .await
            {
                Ok(_) => {
                    if let Err(e) = self
                        .store
                        .finish_mailbox_entry(entry.id, MailboxStatus::Delivered, None)
                        .await
                    {
                        warn!("Failed to mark mailbox entry {} delivered: {}", entry.id, e);
                    }
                    debug!("Delivered mailbox entry {} to {}", entry.id, session_id);
                    return true;
                }
                Err(e) => {
                    self.fail_entry(&entry, &e.to_string()).await;
                }
            }
        }
    }

    async fn fail_entry(&self, entry: &MailboxEntry, error: &str) {
        warn!("Mailbox entry {} for {} failed: {}", entry.id, entry.session_id, error);
        if let Err(e) = self
            .store
            .finish_mailbox_entry(entry.id, MailboxStatus::Failed, Some(error))
            .await
        {
            warn!("Failed to mark mailbox entry {} failed: {}", entry.id, e);
        }
    }

    async fn is_duplicate(&self, session_id: &str, content: &str) -> HubResult<bool> {
        let window = chrono::Duration::from_std(self.duplicate_window)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let since = Utc::now() - window;
        if self
            .store
            .has_recent_user_message(session_id, content, since)
            .await?
        {
            return Ok(true);
        }
        self.store
            .has_recent_pending_entry(session_id, content, since)
            .await
    }

    async fn record_user_message(&self, session_id: &str, content: &str, metadata: &Value) {
        let turn = self.store.max_turn(session_id).await.unwrap_or(0);
        let payload = json!({ "type": "user", "content": content, "metadata": metadata });
        match self
            .store
            .append_stream_event(session_id, StreamEventKind::User, &payload, turn)
            .await
        {
            Ok(_) => {
                self.broadcast.broadcast_session(
                    session_id,
                    ServerMessage::StreamEvent {
                        session_id: session_id.to_string(),
                        kind: StreamEventKind::User,
                        turn,
                        payload,
                    },
                );
            }
            Err(e) => warn!("Failed to record user message for {}: {}", session_id, e),
        }
    }
}
