use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::core::error::{HubError, HubResult};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::{Delivery, InboundMessage, QueryOutcome};
use crate::core::store::{
    DbEnum, EventStatus, MailboxKind, RunStatus, ScheduledAction, ScheduledEvent, Store, TriggerKind,
};
use crate::core::tasks::TaskScheduler;

pub const RESTART_REASON: &str = "interrupted by process restart";

#[derive(Debug, Clone, Deserialize)]
pub struct EventDraft {
    pub action: ScheduledAction,
    #[serde(default)]
    pub fire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delay_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventPatch {
    #[serde(default)]
    pub action: Option<ScheduledAction>,
    #[serde(default)]
    pub fire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delay_seconds: Option<f64>,
}

/// One-off events: a poll loop claims due rows and dispatches each in its
/// own tracked task.
pub struct EventEngine {
    store: Store,
    tasks: Arc<TaskScheduler>,
    tracker: TaskTracker,
    poll_interval: Duration,
    cancel: CancellationToken,
    weak_self: Weak<EventEngine>,
}

impl EventEngine {
    pub fn new(tasks: Arc<TaskScheduler>, tracker: TaskTracker, poll_interval: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            store: tasks.store().clone(),
            tasks,
            tracker,
            poll_interval,
            cancel: CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    pub async fn create(&self, draft: EventDraft) -> HubResult<ScheduledEvent> {
        let fire_at = resolve_fire_time(draft.fire_at, draft.delay_seconds)?
            .ok_or_else(|| HubError::validation("fire_at or delay_seconds is required"))?;
        self.validate_action(&draft.action).await?;
        let event = self
            .store
            .insert_scheduled_event(&draft.action, fire_at)
            .await?;
        info!(
            "Scheduled {} event {} for {}",
            event.action.kind_str(),
            event.id,
            event.fire_at
        );
        Ok(event)
    }

    pub async fn update(&self, id: &str, patch: EventPatch) -> HubResult<ScheduledEvent> {
        let fire_at = resolve_fire_time(patch.fire_at, patch.delay_seconds)?;
        if let Some(action) = &patch.action {
            self.validate_action(action).await?;
        }
        self.store
            .update_pending_event(id, patch.action.as_ref(), fire_at)
            .await
    }

    pub async fn cancel(&self, id: &str) -> HubResult<ScheduledEvent> {
        let event = self.store.cancel_pending_event(id).await?;
        info!("Cancelled scheduled event {}", id);
        Ok(event)
    }

    pub async fn get(&self, id: &str) -> HubResult<ScheduledEvent> {
        self.store
            .get_scheduled_event(id)
            .await?
            .ok_or_else(|| HubError::not_found(format!("event {}", id)))
    }

    pub async fn list(&self, status: Option<EventStatus>, limit: usize) -> HubResult<Vec<ScheduledEvent>> {
        self.store.list_scheduled_events(status, limit).await
    }

    async fn validate_action(&self, action: &ScheduledAction) -> HubResult<()> {
        match action {
            ScheduledAction::Task { task_id } => {
                if self.store.get_task(task_id).await?.is_none() {
                    return Err(HubError::validation(format!("task {} does not exist", task_id)));
                }
            }
            ScheduledAction::Webhook { path, .. } => {
                if path.trim().is_empty() {
                    return Err(HubError::validation("webhook path is required"));
                }
            }
            ScheduledAction::Message {
                session_id,
                content,
            } => {
                if content.trim().is_empty() {
                    return Err(HubError::validation("message content is required"));
                }
                if self.store.get_session(session_id).await?.is_none() {
                    return Err(HubError::validation(format!(
                        "session {} does not exist",
                        session_id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Claim every due event and spawn its dispatch. Returns how many this
    /// tick claimed.
    pub async fn poll_once(&self) -> HubResult<usize> {
        let Some(this) = self.weak_self.upgrade() else {
            return Ok(0);
        };
        let due = self.store.due_scheduled_events(Utc::now()).await?;
        let mut claimed = 0;
        for event in due {
            if !self.store.claim_scheduled_event(&event.id).await? {
                continue;
            }
            claimed += 1;
            let engine = this.clone();
            self.tracker.spawn(async move { engine.run_event(event).await });
        }
        Ok(claimed)
    }

    async fn run_event(&self, event: ScheduledEvent) {
        info!("Dispatching {} event {}", event.action.kind_str(), event.id);
        let (status, summary, error) = match self.dispatch(&event).await {
            Ok(summary) => (EventStatus::Completed, Some(summary), None),
            Err(e) => {
                warn!("Scheduled event {} failed: {}", event.id, e);
                (EventStatus::Failed, None, Some(e.to_string()))
            }
        };
        if let Err(e) = self
            .store
            .finish_scheduled_event(&event.id, status, summary.as_deref(), error.as_deref())
            .await
        {
            error!("Could not record outcome of event {}: {}", event.id, e);
        }
    }

    async fn dispatch(&self, event: &ScheduledEvent) -> HubResult<String> {
        match &event.action {
            ScheduledAction::Task { task_id } => {
                let task = self.store.require_task(task_id).await?;
                let run = self
                    .tasks
                    .execute_task(&task, TriggerKind::Scheduled, None)
                    .await?;
                match run.status {
                    RunStatus::Completed => Ok(run
                        .summary
                        .unwrap_or_else(|| format!("task run {} completed", run.id))),
                    status => Err(HubError::Upstream(run.error.unwrap_or_else(|| {
                        format!("task run {} ended {}", run.id, status.as_str())
                    }))),
                }
            }
            ScheduledAction::Webhook { path, payload } => {
                let dispatch = self.tasks.dispatch_webhook(path, payload.clone()).await?;
                Ok(match dispatch.run {
                    Some(run) => format!(
                        "started task run {}; delivered to {} subscriber(s)",
                        run.id,
                        dispatch.delivered_to.len()
                    ),
                    None => format!(
                        "delivered to {} subscriber(s)",
                        dispatch.delivered_to.len()
                    ),
                })
            }
            ScheduledAction::Message {
                session_id,
                content,
            } => {
                let message = InboundMessage {
                    session_id: session_id.clone(),
                    kind: MailboxKind::System,
                    content: content.clone(),
                    metadata: json!({ "scheduled_event": event.id }),
                };
                match self.tasks.orchestrator().deliver(message).await? {
                    Delivery::Started(handle) => match handle.wait().await {
                        QueryOutcome::Completed { summary, .. } => {
                            Ok(summary.unwrap_or_else(|| "delivered".to_string()))
                        }
                        QueryOutcome::Failed { error } => Err(HubError::Upstream(error)),
                        outcome => Err(HubError::conflict(format!(
                            "invocation ended {}",
                            outcome.status()
                        ))),
                    },
                    Delivery::Queued(entry) => Ok(format!("queued as mailbox entry {}", entry.id)),
                    Delivery::Duplicate => Ok("dropped as duplicate".to_string()),
                }
            }
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!("Scheduled event poll failed: {}", e);
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for EventEngine {
    fn name(&self) -> &'static str {
        "events"
    }

    async fn on_start(&self) -> Result<()> {
        let failed = self.store.fail_running_events(RESTART_REASON).await?;
        if failed > 0 {
            warn!("Marked {} scheduled event(s) left running as failed", failed);
        }
        if let Some(this) = self.weak_self.upgrade() {
            self.tracker.spawn(this.poll_loop());
        }
        info!(
            "Scheduled event engine polling every {}s",
            self.poll_interval.as_secs()
        );
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Absolute time wins; a relative delay counts from now.
fn resolve_fire_time(
    fire_at: Option<DateTime<Utc>>,
    delay_seconds: Option<f64>,
) -> HubResult<Option<DateTime<Utc>>> {
    match (fire_at, delay_seconds) {
        (Some(_), Some(_)) => Err(HubError::validation(
            "give either fire_at or delay_seconds, not both",
        )),
        (Some(at), None) => Ok(Some(at)),
        (None, Some(delay)) => fire_after_delay(delay).map(Some),
        (None, None) => Ok(None),
    }
}

/// Now plus `seconds`. Negative, non-finite and out-of-calendar delays are
/// rejected.
pub(crate) fn fire_after_delay(seconds: f64) -> HubResult<DateTime<Utc>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(HubError::validation(
            "delay_seconds must be a non-negative number",
        ));
    }
    ChronoDuration::try_milliseconds((seconds * 1000.0) as i64)
        .and_then(|delay| Utc::now().checked_add_signed(delay))
        .ok_or_else(|| {
            HubError::validation(format!("delay_seconds {} is out of range", seconds))
        })
}
