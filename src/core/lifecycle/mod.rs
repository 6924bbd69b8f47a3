use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_init(&self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&self) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Starts components in attach order and shuts them down in reverse.
pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<Arc<dyn LifecycleComponent>>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::Init,
            components: Vec::new(),
        }
    }

    pub fn attach(&mut self, component: Arc<dyn LifecycleComponent>) {
        self.components.push(component);
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.on_init().await?;
        }

        info!("Lifecycle Phase: Starting");
        self.state = LifecycleState::Starting;
        for comp in &self.components {
            info!("Starting {}", comp.name());
            comp.on_start().await?;
        }

        info!("Lifecycle Phase: Ready");
        self.state = LifecycleState::Ready;
        Ok(())
    }

    /// Errors are logged so that one failing component never blocks the rest.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;

        for comp in self.components.iter().rev() {
            if let Err(e) = comp.on_shutdown().await {
                warn!("{} shutdown error: {}", comp.name(), e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail_shutdown: bool,
    }

    #[async_trait::async_trait]
    impl LifecycleComponent for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_start(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn on_shutdown(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            if self.fail_shutdown {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_runs_in_reverse_and_survives_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = LifecycleManager::new();
        for (name, fail_shutdown) in [("a", false), ("b", true), ("c", false)] {
            manager.attach(Arc::new(Recorder {
                name,
                log: log.clone(),
                fail_shutdown,
            }));
        }

        manager.start().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Ready);
        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), LifecycleState::Shutdown);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start a", "start b", "start c", "stop c", "stop b", "stop a"]
        );
    }
}
