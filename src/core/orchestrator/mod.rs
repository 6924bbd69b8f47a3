mod mailbox;
mod registry;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::core::agent::{AgentBackend, Invocation, InvokeOptions, InvokeRequest};
use crate::core::broadcast::{BroadcastRouter, ServerMessage};
use crate::core::error::{HubError, HubResult};
use crate::core::store::{MailboxKind, Session, Store, StreamEventKind};

pub use mailbox::{Delivery, InboundMessage};
use registry::{ActiveRegistry, Reservation};

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Completed { summary: Option<String>, turns: u32 },
    Failed { error: String },
    Interrupted { summary: Option<String> },
    /// Forcibly ended: superseded by a newer submit, or shut down.
    Closed,
}

impl QueryOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            QueryOutcome::Completed { .. } => "completed",
            QueryOutcome::Failed { .. } => "failed",
            QueryOutcome::Interrupted { .. } => "interrupted",
            QueryOutcome::Closed => "closed",
        }
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            QueryOutcome::Completed { summary, .. } | QueryOutcome::Interrupted { summary } => {
                summary.as_deref()
            }
            QueryOutcome::Failed { error } => Some(error),
            QueryOutcome::Closed => None,
        }
    }
}

/// Awaitable result of a started invocation.
pub struct QueryHandle {
    pub session_id: String,
    outcome: oneshot::Receiver<QueryOutcome>,
}

impl QueryHandle {
    pub async fn wait(self) -> QueryOutcome {
        self.outcome.await.unwrap_or(QueryOutcome::Closed)
    }
}

/// Runs at most one agent invocation per session, persisting and
/// broadcasting everything it yields.
pub struct Orchestrator {
    store: Store,
    broadcast: Arc<BroadcastRouter>,
    backend: Arc<dyn AgentBackend>,
    active: ActiveRegistry,
    tracker: TaskTracker,
    shutting_down: AtomicBool,
    duplicate_window: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        broadcast: Arc<BroadcastRouter>,
        backend: Arc<dyn AgentBackend>,
        tracker: TaskTracker,
        duplicate_window: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broadcast,
            backend,
            active: ActiveRegistry::default(),
            tracker,
            shutting_down: AtomicBool::new(false),
            duplicate_window,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.active.is_active(session_id)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.active.active_sessions()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Start an invocation, closing any invocation already running for the
    /// session. The newest submission always wins.
    pub async fn submit(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        options: InvokeOptions,
    ) -> HubResult<QueryHandle> {
        if self.is_shutting_down() {
            return Err(HubError::conflict("hub is shutting down"));
        }
        let session = self.store.require_session(session_id).await?;
        let Some((reservation, previous)) = self.active.replace(session_id) else {
            return Err(HubError::conflict("hub is shutting down"));
        };
        if let Some(previous) = previous {
            info!("Closing running invocation of session {} for a newer submit", session_id);
            previous.stop();
        }
        self.start(session, reservation, prompt.to_string(), options)
            .await
    }

    /// Cooperative stop. False when nothing is running for the session.
    pub fn interrupt(&self, session_id: &str) -> bool {
        let interrupted = self.active.interrupt(session_id);
        if interrupted {
            info!("Interrupt requested for session {}", session_id);
        }
        interrupted
    }

    /// Stop admitting invocations. Returns the sessions still running, none
    /// of which can be joined by another afterwards.
    pub fn begin_shutdown(&self) -> Vec<String> {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.active.seal()
    }

    /// Stop accepting new work and force-close every running invocation.
    /// Returns the sessions that were active.
    pub fn close_all(&self) -> Vec<String> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let drained = self.active.drain_all();
        let mut sessions = Vec::with_capacity(drained.len());
        for (session_id, query) in drained {
            query.stop();
            sessions.push(session_id);
        }
        sessions
    }

    /// Ask to deliver a completion notice to `subscriber` when `target`
    /// next finishes.
    pub async fn watch(&self, subscriber: &str, target: &str) -> HubResult<()> {
        if subscriber == target {
            return Err(HubError::validation("a session cannot watch itself"));
        }
        self.store.require_session(subscriber).await?;
        self.store.require_session(target).await?;
        self.store.add_watch(subscriber, target).await?;
        self.broadcast.broadcast_session(
            subscriber,
            ServerMessage::WatchRegistered {
                subscriber: subscriber.to_string(),
                target: target.to_string(),
            },
        );
        Ok(())
    }

    async fn start(
        self: &Arc<Self>,
        session: Session,
        reservation: Reservation,
        prompt: String,
        options: InvokeOptions,
    ) -> HubResult<QueryHandle> {
        let session_id = session.id.clone();
        self.broadcast.broadcast_global(ServerMessage::SessionBusy {
            session_id: session_id.clone(),
        });

        let request = InvokeRequest {
            prompt,
            continuation_token: session.continuation_token.clone(),
            working_dir: PathBuf::from(&session.working_dir),
            options: options.clone(),
        };
        let invocation = match self.backend.invoke(request).await {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!("Failed to start invocation for session {}: {}", session_id, e);
                if self.active.release(&session_id, reservation.generation) {
                    self.broadcast_error(&session_id, &e.to_string());
                    self.broadcast_idle(&session_id);
                }
                return Err(e);
            }
        };

        if !self
            .active
            .attach_control(&session_id, reservation.generation, invocation.control.clone())
        {
            invocation.control.close();
            return Err(HubError::conflict(format!(
                "session {} was taken over by a newer submit",
                session_id
            )));
        }

        let (tx, rx) = oneshot::channel();
        self.tracker.spawn(self.clone().run_stream(
            session_id.clone(),
            reservation,
            invocation,
            options,
            tx,
        ));
        Ok(QueryHandle {
            session_id,
            outcome: rx,
        })
    }

    /// Consume the invocation's events until it ends. Boxed because the
    /// completion path can start the next invocation.
    fn run_stream(
        self: Arc<Self>,
        session_id: String,
        reservation: Reservation,
        invocation: Invocation,
        options: InvokeOptions,
        tx: oneshot::Sender<QueryOutcome>,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Invocation {
                mut events,
                control,
            } = invocation;
            let mut turn = match self.store.max_turn(&session_id).await {
                Ok(turn) => turn,
                Err(e) => {
                    warn!("Failed to read turn counter of {}: {}", session_id, e);
                    0
                }
            };
            let first_turn = turn;
            let mut summary: Option<String> = None;
            let mut failure: Option<String> = None;
            let mut limit_hit = false;
            let mut saved_token: Option<String> = None;

            let closed = loop {
                let next = tokio::select! {
                    biased;
                    _ = reservation.cancel.cancelled() => break true,
                    next = events.next() => next,
                };
                let event = match next {
                    None => break false,
                    Some(Err(e)) => {
                        failure = Some(e.to_string());
                        break false;
                    }
                    Some(Ok(event)) => event,
                };

                if event.kind == StreamEventKind::Assistant {
                    turn += 1;
                }
                let cost = event.reported_cost();
                if let Some(text) = event.assistant_text().or_else(|| event.result_text()) {
                    summary = Some(text);
                }
                if event.is_failure() {
                    failure = Some(
                        event
                            .result_text()
                            .or_else(|| {
                                event.payload.get("error").map(|e| match e.as_str() {
                                    Some(text) => text.to_string(),
                                    None => e.to_string(),
                                })
                            })
                            .unwrap_or_else(|| "agent reported an error".to_string()),
                    );
                }
                if let Some(announced) = &event.session_id
                    && saved_token.as_ref() != Some(announced)
                {
                    if let Err(e) = self.store.set_continuation_token(&session_id, announced).await {
                        warn!("Failed to store continuation token for {}: {}", session_id, e);
                    }
                    saved_token = Some(announced.clone());
                }

                if let Err(e) = self
                    .store
                    .append_stream_event(&session_id, event.kind, &event.payload, turn)
                    .await
                {
                    warn!("Failed to persist stream event for {}: {}", session_id, e);
                }
                self.broadcast.broadcast_session(
                    &session_id,
                    ServerMessage::StreamEvent {
                        session_id: session_id.clone(),
                        kind: event.kind,
                        turn,
                        payload: event.payload,
                    },
                );

                if !limit_hit {
                    let over_turns = options
                        .max_turns
                        .is_some_and(|max| turn.saturating_sub(first_turn) >= max);
                    let over_spend = match (options.max_spend_usd, cost) {
                        (Some(max), Some(cost)) => cost > max,
                        _ => false,
                    };
                    if over_turns || over_spend {
                        info!(
                            "Session {} reached its {} limit; interrupting",
                            session_id,
                            if over_turns { "turn" } else { "spend" }
                        );
                        limit_hit = true;
                        control.interrupt();
                    }
                }
            };

            let outcome = if closed {
                control.close();
                if reservation.interrupted.load(Ordering::SeqCst) {
                    QueryOutcome::Interrupted { summary }
                } else {
                    QueryOutcome::Closed
                }
            } else if reservation.interrupted.load(Ordering::SeqCst) || limit_hit {
                QueryOutcome::Interrupted { summary }
            } else if let Some(error) = failure {
                QueryOutcome::Failed { error }
            } else {
                QueryOutcome::Completed {
                    summary,
                    turns: turn.saturating_sub(first_turn),
                }
            };

            self.finish(&session_id, reservation.generation, outcome, tx)
                .await;
        })
    }

    async fn finish(
        self: &Arc<Self>,
        session_id: &str,
        generation: u64,
        outcome: QueryOutcome,
        tx: oneshot::Sender<QueryOutcome>,
    ) {
        if let Err(e) = self.store.touch_session(session_id).await {
            warn!("Failed to update activity time of {}: {}", session_id, e);
        }
        info!(
            "Invocation for session {} ended: {}",
            session_id,
            outcome.status()
        );

        // With mail waiting, the slot goes straight to the oldest entry so
        // nothing newer can start in between.
        let handoff = if self.active.owns(session_id, generation)
            && !self.is_shutting_down()
            && self.store.has_pending_mail(session_id).await.unwrap_or(false)
        {
            self.active.renew(session_id, generation)
        } else {
            None
        };
        let owned = handoff.is_some() || self.active.release(session_id, generation);

        if owned {
            if let QueryOutcome::Failed { error } = &outcome {
                self.broadcast_error(session_id, error);
            }
            self.broadcast_idle(session_id);
            self.broadcast.broadcast_global(ServerMessage::QueryComplete {
                session_id: session_id.to_string(),
                status: outcome.status().to_string(),
                summary: outcome.summary().map(str::to_string),
            });
        }
        let _ = tx.send(outcome.clone());

        if !owned || self.is_shutting_down() {
            if let Some(reservation) = handoff {
                self.active.release(session_id, reservation.generation);
            }
            return;
        }
        self.drain_from(session_id, handoff).await;
        self.notify_watchers(session_id, &outcome).await;
    }

    async fn notify_watchers(self: &Arc<Self>, target: &str, outcome: &QueryOutcome) {
        let watchers = match self.store.take_watchers(target).await {
            Ok(watchers) => watchers,
            Err(e) => {
                warn!("Failed to load watchers of {}: {}", target, e);
                return;
            }
        };
        for watcher in watchers {
            let mut content = format!("[watch] Session {} finished ({}).", target, outcome.status());
            if let Some(summary) = outcome.summary() {
                content.push_str("\n\n");
                content.push_str(summary);
            }
            let message = InboundMessage {
                session_id: watcher.clone(),
                kind: MailboxKind::Watch,
                content,
                metadata: json!({ "target": target, "status": outcome.status() }),
            };
            if let Err(e) = self.deliver(message).await {
                warn!("Failed to notify watcher {} of {}: {}", watcher, target, e);
            }
        }
    }

    fn broadcast_idle(&self, session_id: &str) {
        self.broadcast.broadcast_global(ServerMessage::SessionIdle {
            session_id: session_id.to_string(),
        });
    }

    fn broadcast_error(&self, session_id: &str, error: &str) {
        self.broadcast.broadcast_session(
            session_id,
            ServerMessage::QueryError {
                session_id: session_id.to_string(),
                error: error.to_string(),
            },
        );
    }
}
