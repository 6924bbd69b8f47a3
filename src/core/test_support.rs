//! Shared fixtures for unit tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use crate::core::agent::scripted::ScriptedBackend;
use crate::core::broadcast::BroadcastRouter;
use crate::core::orchestrator::Orchestrator;
use crate::core::store::{Session, Store};
use crate::core::tasks::TaskScheduler;

pub struct Fixture {
    pub store: Store,
    pub backend: Arc<ScriptedBackend>,
    pub broadcast: Arc<BroadcastRouter>,
    pub orchestrator: Arc<Orchestrator>,
    pub tracker: TaskTracker,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Store::open_in_memory().unwrap();
        let backend = ScriptedBackend::new();
        let broadcast = Arc::new(BroadcastRouter::new());
        let tracker = TaskTracker::new();
        let orchestrator = Orchestrator::new(
            store.clone(),
            broadcast.clone(),
            backend.clone(),
            tracker.clone(),
            Duration::from_secs(5),
        );
        Self {
            store,
            backend,
            broadcast,
            orchestrator,
            tracker,
        }
    }

    pub async fn session(&self, name: &str) -> Session {
        self.store
            .create_session(name, &std::env::temp_dir().to_string_lossy())
            .await
            .unwrap()
    }

    pub async fn tasks(&self) -> Arc<TaskScheduler> {
        TaskScheduler::new(
            self.store.clone(),
            self.orchestrator.clone(),
            self.tracker.clone(),
            std::env::temp_dir(),
        )
        .await
        .unwrap()
    }
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not reached in time");
}
