use anyhow::Result;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::core::error::HubResult;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::{InboundMessage, Orchestrator};
use crate::core::store::{MailboxKind, Store};

pub const RESUME_PROMPT: &str = "The hub restarted while you were working on this session. \
Review your most recent messages and tool results, work out where you stopped, \
and continue the task from there.";

const MAILBOX_RESTART_REASON: &str = "interrupted by process restart";

/// Flags sessions that are mid-invocation at shutdown and resumes them,
/// one stagger apart, on the next start.
pub struct RecoveryManager {
    orchestrator: Arc<Orchestrator>,
    store: Store,
    tracker: TaskTracker,
    stagger: Duration,
    cancel: CancellationToken,
}

impl RecoveryManager {
    pub fn new(orchestrator: Arc<Orchestrator>, tracker: TaskTracker, stagger: Duration) -> Arc<Self> {
        Arc::new(Self {
            store: orchestrator.store().clone(),
            orchestrator,
            tracker,
            stagger,
            cancel: CancellationToken::new(),
        })
    }

    /// Durably flag every active session, then force-close all invocations.
    /// Returns the flagged session ids.
    pub async fn flag_and_close(&self) -> HubResult<Vec<String>> {
        // Admission stops first so nothing can start between the snapshot
        // and the close.
        let active = self.orchestrator.begin_shutdown();
        let flagged = self.store.flag_sessions_for_resume(&active).await;
        // Close even if flagging failed so shutdown can still proceed.
        let closed = self.orchestrator.close_all();
        let flagged = flagged?;
        if !closed.is_empty() {
            info!(
                "Closed {} active invocation(s); {} flagged for resume",
                closed.len(),
                flagged
            );
        }
        Ok(active)
    }

    /// Resume flagged sessions in flag order, then drain idle mailboxes.
    /// Returns the number of sessions scheduled for resurrection.
    pub async fn resurrect(&self) -> HubResult<usize> {
        let failed = self
            .store
            .fail_processing_mailbox_entries(MAILBOX_RESTART_REASON)
            .await?;
        if failed > 0 {
            warn!("Marked {} mailbox entries left processing as failed", failed);
        }

        let flagged = self.store.take_resume_flags().await?;
        let resumed: HashSet<String> = flagged.iter().map(|s| s.id.clone()).collect();
        for (index, session) in flagged.into_iter().enumerate() {
            let delay = self.stagger * index as u32;
            let orchestrator = self.orchestrator.clone();
            let cancel = self.cancel.clone();
            self.tracker.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                info!("Resuming session '{}' ({})", session.name, session.id);
                let message = InboundMessage {
                    session_id: session.id.clone(),
                    kind: MailboxKind::System,
                    content: RESUME_PROMPT.to_string(),
                    metadata: json!({ "resurrection": true }),
                };
                if let Err(e) = orchestrator.deliver(message).await {
                    error!("Failed to resume session {}: {}", session.id, e);
                }
            });
        }

        for session_id in self.store.sessions_with_pending_mail().await? {
            if resumed.contains(&session_id) || self.orchestrator.is_active(&session_id) {
                continue;
            }
            self.orchestrator.drain_mailbox(&session_id).await;
        }

        if !resumed.is_empty() {
            info!("Scheduled {} session(s) for resurrection", resumed.len());
        }
        Ok(resumed.len())
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for RecoveryManager {
    fn name(&self) -> &'static str {
        "recovery"
    }

    async fn on_start(&self) -> Result<()> {
        self.resurrect().await?;
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.flag_and_close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::scripted::ScriptedBackend;
    use crate::core::error::HubError;
    use crate::core::agent::InvokeOptions;
    use crate::core::orchestrator::QueryOutcome;
    use crate::core::store::MailboxStatus;
    use crate::core::test_support::{Fixture, eventually};
    use tokio::sync::Notify;

    #[tokio::test]
    async fn shutdown_flags_active_sessions_and_closes_them() {
        let fx = Fixture::new();
        let busy = fx.session("busy").await;
        let idle = fx.session("idle").await;
        let recovery = RecoveryManager::new(fx.orchestrator.clone(), fx.tracker.clone(), Duration::from_secs(3));

        fx.backend
            .push_script(ScriptedBackend::gated("tok", Arc::new(Notify::new()), "never"));
        let handle = fx
            .orchestrator
            .submit(&busy.id, "long job", InvokeOptions::default())
            .await
            .unwrap();

        recovery.on_shutdown().await.unwrap();
        assert_eq!(handle.wait().await, QueryOutcome::Closed);

        assert!(fx.store.require_session(&busy.id).await.unwrap().resume_pending);
        assert!(!fx.store.require_session(&idle.id).await.unwrap().resume_pending);
        assert!(matches!(
            fx.orchestrator
                .submit(&idle.id, "late", InvokeOptions::default())
                .await,
            Err(HubError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn nothing_starts_unflagged_once_shutdown_begins() {
        let fx = Fixture::new();
        let busy = fx.session("busy").await;
        let late = fx.session("late").await;
        fx.backend
            .push_script(ScriptedBackend::gated("tok", Arc::new(Notify::new()), "never"));
        fx.orchestrator
            .submit(&busy.id, "long job", InvokeOptions::default())
            .await
            .unwrap();

        // A cron firing or an event dispatch racing the flag step.
        assert_eq!(fx.orchestrator.begin_shutdown(), vec![busy.id.clone()]);
        assert!(matches!(
            fx.orchestrator
                .submit(&late.id, "cron prompt", InvokeOptions::default())
                .await,
            Err(HubError::Conflict(_))
        ));
        assert!(
            fx.orchestrator
                .deliver(InboundMessage::chat(&late.id, "scheduled"))
                .await
                .is_ok()
        );
        assert!(!fx.orchestrator.is_active(&late.id));

        let recovery = RecoveryManager::new(fx.orchestrator.clone(), fx.tracker.clone(), Duration::from_secs(3));
        assert_eq!(recovery.flag_and_close().await.unwrap(), vec![busy.id.clone()]);
        assert!(fx.store.require_session(&busy.id).await.unwrap().resume_pending);
        assert!(!fx.store.require_session(&late.id).await.unwrap().resume_pending);
        assert_eq!(fx.backend.prompts(), vec!["long job"]);
    }

    #[tokio::test(start_paused = true)]
    async fn flagged_sessions_resume_once_in_flag_order() {
        let fx = Fixture::new();
        let first = fx.session("first").await;
        let second = fx.session("second").await;
        fx.store
            .flag_sessions_for_resume(&[second.id.clone()])
            .await
            .unwrap();
        fx.store
            .flag_sessions_for_resume(&[first.id.clone()])
            .await
            .unwrap();

        let recovery = RecoveryManager::new(fx.orchestrator.clone(), fx.tracker.clone(), Duration::from_secs(3));
        assert_eq!(recovery.resurrect().await.unwrap(), 2);
        // Flags are cleared before anything is delivered.
        assert!(fx.store.take_resume_flags().await.unwrap().is_empty());

        // The earlier-flagged session goes first; the other waits a stagger.
        let backend = fx.backend.clone();
        eventually(|| {
            let backend = backend.clone();
            async move { backend.calls().len() == 1 }
        })
        .await;
        let store = fx.store.clone();
        let second_id = second.id.clone();
        eventually(|| {
            let store = store.clone();
            let second_id = second_id.clone();
            async move { !store.list_stream_events(&second_id, None, 10).await.unwrap().is_empty() }
        })
        .await;
        assert!(fx.store.list_stream_events(&first.id, None, 10).await.unwrap().is_empty());

        eventually(|| {
            let backend = backend.clone();
            async move { backend.calls().len() == 2 }
        })
        .await;
        let calls = fx.backend.calls();
        assert!(calls.iter().all(|c| c.prompt == RESUME_PROMPT));
        assert!(calls[1].at - calls[0].at >= Duration::from_secs(3));

        // Resurrecting again finds nothing left to do.
        assert_eq!(recovery.resurrect().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.backend.calls().len(), 2);
    }

    #[tokio::test]
    async fn startup_drains_pending_mail_of_idle_sessions() {
        let fx = Fixture::new();
        let session = fx.session("queued").await;
        let stuck = fx
            .store
            .push_mailbox_entry(&session.id, MailboxKind::Chat, "stuck", &json!({}))
            .await
            .unwrap();
        fx.store.claim_next_mailbox_entry(&session.id).await.unwrap();
        fx.store
            .push_mailbox_entry(&session.id, MailboxKind::Chat, "waiting", &json!({}))
            .await
            .unwrap();

        let recovery = RecoveryManager::new(fx.orchestrator.clone(), fx.tracker.clone(), Duration::from_secs(3));
        recovery.resurrect().await.unwrap();

        let backend = fx.backend.clone();
        eventually(|| {
            let backend = backend.clone();
            async move { backend.prompts() == vec!["waiting"] }
        })
        .await;
        let failed = fx
            .store
            .list_mailbox(&session.id, Some(MailboxStatus::Failed))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, stuck.id);
    }
}
