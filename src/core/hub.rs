use anyhow::Result;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::core::agent::AgentBackend;
use crate::core::broadcast::{BroadcastRouter, BroadcastService};
use crate::core::config::HubConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::orchestrator::Orchestrator;
use crate::core::recovery::RecoveryManager;
use crate::core::scheduled::EventEngine;
use crate::core::store::Store;
use crate::core::tasks::TaskScheduler;

/// Every long-lived service, built once and shared by `Arc`.
#[derive(Clone)]
pub struct Hub {
    pub config: Arc<HubConfig>,
    pub store: Store,
    pub broadcast: Arc<BroadcastRouter>,
    pub orchestrator: Arc<Orchestrator>,
    pub tasks: Arc<TaskScheduler>,
    pub events: Arc<EventEngine>,
    pub recovery: Arc<RecoveryManager>,
    /// Stream loops, cron firings, event dispatches and resurrections.
    pub tracker: TaskTracker,
    broadcast_service: Arc<BroadcastService>,
}

impl Hub {
    pub async fn open(config: HubConfig, backend: Arc<dyn AgentBackend>) -> Result<Self> {
        let store = Store::open(&config.db_path()).await?;
        Self::with_store(config, store, backend).await
    }

    pub async fn with_store(
        config: HubConfig,
        store: Store,
        backend: Arc<dyn AgentBackend>,
    ) -> Result<Self> {
        let tracker = TaskTracker::new();
        let broadcast = Arc::new(BroadcastRouter::new());
        let orchestrator = Orchestrator::new(
            store.clone(),
            broadcast.clone(),
            backend,
            tracker.clone(),
            config.duplicate_window(),
        );
        let tasks = TaskScheduler::new(
            store.clone(),
            orchestrator.clone(),
            tracker.clone(),
            config.working_dir(),
        )
        .await?;
        let events = EventEngine::new(tasks.clone(), tracker.clone(), config.poll_interval());
        let recovery = RecoveryManager::new(
            orchestrator.clone(),
            tracker.clone(),
            config.resurrection_stagger(),
        );
        let broadcast_service = Arc::new(BroadcastService::new(
            broadcast.clone(),
            config.ping_interval(),
            tracker.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            broadcast,
            orchestrator,
            tasks,
            events,
            recovery,
            tracker,
            broadcast_service,
        })
    }

    /// Core components in start order. Shutdown runs in reverse, so
    /// recovery flags and closes invocations before timers and the poll
    /// loop stop, and listeners are closed last.
    pub fn lifecycle(&self) -> LifecycleManager {
        let mut lifecycle = LifecycleManager::new();
        lifecycle.attach(self.broadcast_service.clone());
        lifecycle.attach(self.tasks.clone());
        lifecycle.attach(self.events.clone());
        lifecycle.attach(self.recovery.clone());
        lifecycle
    }

    /// Wait for tracked work to finish, up to the shutdown timeout.
    /// Returns false when the timeout expired first.
    pub async fn drain(&self) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!("Waiting for {} tracked execution(s) to finish", pending);
        }
        match tokio::time::timeout(self.config.shutdown_timeout(), self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    "{} tracked execution(s) still running after {:?}",
                    self.tracker.len(),
                    self.config.shutdown_timeout()
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::InvokeOptions;
    use crate::core::agent::scripted::ScriptedBackend;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn full_lifecycle_flags_and_resumes_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig::from_toml(&format!(
            "data_dir = '{}'\n[scheduler]\nresurrection_stagger_secs = 0\nshutdown_timeout_secs = 2\n",
            dir.path().display()
        ))
        .unwrap();

        let backend = ScriptedBackend::new();
        let hub = Hub::open(config.clone(), backend.clone()).await.unwrap();
        let mut lifecycle = hub.lifecycle();
        lifecycle.start().await.unwrap();

        let session = hub.store.create_session("long", "/tmp").await.unwrap();
        backend.push_script(ScriptedBackend::gated("tok", Arc::new(Notify::new()), "never"));
        hub.orchestrator
            .submit(&session.id, "work", InvokeOptions::default())
            .await
            .unwrap();

        lifecycle.shutdown().await.unwrap();
        assert!(hub.drain().await);
        assert!(hub.store.require_session(&session.id).await.unwrap().resume_pending);
        drop(lifecycle);
        drop(hub);

        let backend = ScriptedBackend::new();
        let hub = Hub::open(config, backend.clone()).await.unwrap();
        let mut lifecycle = hub.lifecycle();
        lifecycle.start().await.unwrap();

        for _ in 0..200 {
            if backend.calls().len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].prompt, crate::core::recovery::RESUME_PROMPT);
        assert_eq!(calls[0].continuation_token.as_deref(), Some("tok"));
        assert!(!hub.store.require_session(&session.id).await.unwrap().resume_pending);

        lifecycle.shutdown().await.unwrap();
        hub.drain().await;
    }
}
