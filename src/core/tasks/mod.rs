pub mod cron_expr;
mod webhook;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::agent::InvokeOptions;
use crate::core::error::{HubError, HubResult};
use crate::core::lifecycle::LifecycleComponent;
use crate::core::orchestrator::{Orchestrator, QueryOutcome};
use crate::core::store::{
    DbEnum, RunStatus, Session, SessionPolicy, Store, Task, TaskRun, TaskTrigger, TriggerKind, now_ts,
};

pub(crate) use webhook::constant_time_eq;
pub use webhook::{WebhookCall, WebhookDispatch, WebhookOutcome};

/// Trigger half of a task creation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerDraft {
    Cron {
        #[serde(default, alias = "cron")]
        expression: Option<String>,
        #[serde(default)]
        timezone: Option<String>,
    },
    Webhook {
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        secret: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskDraft {
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub trigger: TriggerDraft,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_policy")]
    pub session_policy: SessionPolicy,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub max_spend_usd: Option<f64>,
}

fn default_policy() -> SessionPolicy {
    SessionPolicy::NewSession
}

fn default_enabled() -> bool {
    true
}

/// Partial update; absent fields keep their value. An empty `secret`
/// removes the secret.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub name: Option<String>,
    pub prompt: Option<String>,
    #[serde(alias = "cron")]
    pub expression: Option<String>,
    pub timezone: Option<String>,
    pub path: Option<String>,
    pub secret: Option<String>,
    pub session_policy: Option<SessionPolicy>,
    pub session_id: Option<String>,
    pub enabled: Option<bool>,
    pub max_turns: Option<u32>,
    pub max_spend_usd: Option<f64>,
}

/// Cron and webhook tasks: validation, persistence, timers and runs.
pub struct TaskScheduler {
    store: Store,
    orchestrator: Arc<Orchestrator>,
    scheduler: JobScheduler,
    /// One live timer per enabled cron task. The lock is held across
    /// uninstall and install so two updates never both install.
    timers: Mutex<HashMap<String, Uuid>>,
    tracker: TaskTracker,
    working_dir: PathBuf,
    weak_self: Weak<TaskScheduler>,
}

impl TaskScheduler {
    pub async fn new(
        store: Store,
        orchestrator: Arc<Orchestrator>,
        tracker: TaskTracker,
        working_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let scheduler = JobScheduler::new().await?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            store,
            orchestrator,
            scheduler,
            timers: Mutex::new(HashMap::new()),
            tracker,
            working_dir,
            weak_self: weak_self.clone(),
        }))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    // --- CRUD ---

    pub async fn create_task(&self, draft: TaskDraft) -> HubResult<Task> {
        let trigger = match draft.trigger {
            TriggerDraft::Cron {
                expression,
                timezone,
            } => TaskTrigger::Cron {
                expression: expression.unwrap_or_default(),
                timezone: timezone.unwrap_or_default(),
            },
            TriggerDraft::Webhook { path, secret } => TaskTrigger::Webhook {
                path: path.unwrap_or_default(),
                secret,
            },
        };
        let now = now_ts();
        let mut task = Task {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            trigger,
            prompt: draft.prompt,
            session_policy: draft.session_policy,
            session_id: draft.session_id,
            enabled: draft.enabled,
            max_turns: draft.max_turns,
            max_spend_usd: draft.max_spend_usd,
            created_at: now.clone(),
            updated_at: now,
        };
        self.validate(&mut task).await?;
        self.store.insert_task(&task).await?;
        info!("Created {} task '{}' ({})", task.trigger.kind().as_str(), task.name, task.id);

        self.sync_timer(&task).await?;
        Ok(task)
    }

    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> HubResult<Task> {
        let mut task = self.store.require_task(id).await?;
        if let Some(name) = patch.name {
            task.name = name;
        }
        if let Some(prompt) = patch.prompt {
            task.prompt = prompt;
        }
        match &mut task.trigger {
            TaskTrigger::Cron {
                expression,
                timezone,
            } => {
                if patch.path.is_some() || patch.secret.is_some() {
                    return Err(HubError::validation(
                        "path and secret only apply to webhook tasks",
                    ));
                }
                if let Some(new_expression) = patch.expression {
                    *expression = new_expression;
                }
                if let Some(new_timezone) = patch.timezone {
                    *timezone = new_timezone;
                }
            }
            TaskTrigger::Webhook { path, secret } => {
                if patch.expression.is_some() || patch.timezone.is_some() {
                    return Err(HubError::validation(
                        "expression and timezone only apply to cron tasks",
                    ));
                }
                if let Some(new_path) = patch.path {
                    *path = new_path;
                }
                if let Some(new_secret) = patch.secret {
                    *secret = Some(new_secret).filter(|s| !s.is_empty());
                }
            }
        }
        if let Some(policy) = patch.session_policy {
            task.session_policy = policy;
        }
        if let Some(session_id) = patch.session_id {
            task.session_id = Some(session_id).filter(|s| !s.is_empty());
        }
        if let Some(enabled) = patch.enabled {
            task.enabled = enabled;
        }
        if patch.max_turns.is_some() {
            task.max_turns = patch.max_turns;
        }
        if patch.max_spend_usd.is_some() {
            task.max_spend_usd = patch.max_spend_usd;
        }
        task.updated_at = now_ts();

        self.validate(&mut task).await?;
        if !self.store.update_task(&task).await? {
            return Err(HubError::not_found(format!("task {}", id)));
        }
        self.sync_timer(&task).await?;
        Ok(task)
    }

    pub async fn delete_task(&self, id: &str) -> HubResult<()> {
        let mut timers = self.timers.lock().await;
        self.uninstall_locked(&mut timers, id).await;
        if !self.store.delete_task(id).await? {
            return Err(HubError::not_found(format!("task {}", id)));
        }
        info!("Deleted task {}", id);
        Ok(())
    }

    async fn validate(&self, task: &mut Task) -> HubResult<()> {
        task.name = task.name.trim().to_string();
        if task.name.is_empty() {
            return Err(HubError::validation("name is required"));
        }
        if task.prompt.trim().is_empty() {
            return Err(HubError::validation("prompt is required"));
        }
        if task.max_turns == Some(0) {
            return Err(HubError::validation("max_turns must be at least 1"));
        }
        if task.max_spend_usd.is_some_and(|max| max <= 0.0) {
            return Err(HubError::validation("max_spend_usd must be positive"));
        }

        match &mut task.trigger {
            TaskTrigger::Cron {
                expression,
                timezone,
            } => {
                *expression = cron_expr::normalize_cron(expression)?;
                *timezone = cron_expr::parse_timezone(Some(timezone.as_str()))?
                    .name()
                    .to_string();
            }
            TaskTrigger::Webhook { path, secret } => {
                let trimmed = path.trim();
                *path = if trimmed.is_empty() {
                    generate_webhook_path()
                } else {
                    trimmed.to_string()
                };
                if !is_valid_webhook_path(path) {
                    return Err(HubError::validation(
                        "webhook path may only contain letters, digits, '-' and '_'",
                    ));
                }
                if self.store.webhook_path_taken(path, Some(&task.id)).await? {
                    return Err(HubError::conflict(format!(
                        "webhook path '{}' is already in use",
                        path
                    )));
                }
                if secret.as_deref().is_some_and(|s| s.is_empty()) {
                    *secret = None;
                }
            }
        }
        Ok(())
    }

    // --- Timers ---

    /// Make the live timer match the task: none unless it is an enabled cron task.
    async fn sync_timer(&self, task: &Task) -> HubResult<()> {
        let mut timers = self.timers.lock().await;
        self.uninstall_locked(&mut timers, &task.id).await;

        let TaskTrigger::Cron {
            expression,
            timezone,
        } = &task.trigger
        else {
            return Ok(());
        };
        if !task.enabled {
            return Ok(());
        }

        let tz = cron_expr::parse_timezone(Some(timezone))?;
        let weak = self.weak_self.clone();
        let task_id = task.id.clone();
        let job = Job::new_async_tz(expression.as_str(), tz, move |_uuid, _lock| {
            let weak = weak.clone();
            let task_id = task_id.clone();
            Box::pin(async move {
                if let Some(scheduler) = weak.upgrade() {
                    let tracker = scheduler.tracker.clone();
                    tracker.spawn(async move { scheduler.fire_cron(&task_id).await });
                }
            })
        })
        .map_err(|e| HubError::validation(format!("invalid cron expression: {}", e)))?;

        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| HubError::Upstream(format!("failed to install timer: {}", e)))?;
        timers.insert(task.id.clone(), job_id);
        info!("Timer installed for task '{}' ({} {})", task.name, expression, timezone);
        Ok(())
    }

    async fn uninstall_locked(&self, timers: &mut HashMap<String, Uuid>, task_id: &str) {
        if let Some(job_id) = timers.remove(task_id)
            && let Err(e) = self.scheduler.remove(&job_id).await
        {
            warn!("Failed to remove timer of task {}: {}", task_id, e);
        }
    }

    pub async fn timer_count(&self) -> usize {
        self.timers.lock().await.len()
    }

    async fn fire_cron(self: Arc<Self>, task_id: &str) {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) if task.enabled => task,
            Ok(_) => return,
            Err(e) => {
                error!("Cron firing could not load task {}: {}", task_id, e);
                return;
            }
        };
        info!("Cron fired for task '{}'", task.name);
        if let Err(e) = self.execute_task(&task, TriggerKind::Cron, None).await {
            error!("Cron run of task '{}' failed: {}", task.name, e);
        }
    }

    // --- Runs ---

    /// Run a task to completion and return its finished run.
    pub async fn execute_task(
        &self,
        task: &Task,
        trigger: TriggerKind,
        payload: Option<Value>,
    ) -> HubResult<TaskRun> {
        let (session, run) = self.prepare_run(task, trigger, payload.as_ref()).await?;
        self.run_prepared(task, &session, run, payload.as_ref()).await
    }

    /// Record the run and start it in the background. The returned run is
    /// still `running`.
    pub async fn spawn_task(
        &self,
        task_id: &str,
        trigger: TriggerKind,
        payload: Option<Value>,
    ) -> HubResult<TaskRun> {
        let task = self.store.require_task(task_id).await?;
        let (session, run) = self.prepare_run(&task, trigger, payload.as_ref()).await?;
        let Some(this) = self.weak_self.upgrade() else {
            return Err(HubError::conflict("task scheduler is shutting down"));
        };
        let spawned = run.clone();
        self.tracker.spawn(async move {
            if let Err(e) = this.run_prepared(&task, &session, run, payload.as_ref()).await {
                error!("Run of task '{}' failed: {}", task.name, e);
            }
        });
        Ok(spawned)
    }

    /// Resolve the session and durably record the run before anything is invoked.
    async fn prepare_run(
        &self,
        task: &Task,
        trigger: TriggerKind,
        payload: Option<&Value>,
    ) -> HubResult<(Session, TaskRun)> {
        let session = self.resolve_session(task).await?;
        let run = self
            .store
            .create_task_run(&task.id, &session.id, trigger, payload)
            .await?;
        info!(
            "Task '{}' run {} ({}) in session {}",
            task.name,
            run.id,
            trigger.as_str(),
            session.id
        );
        Ok((session, run))
    }

    async fn run_prepared(
        &self,
        task: &Task,
        session: &Session,
        run: TaskRun,
        payload: Option<&Value>,
    ) -> HubResult<TaskRun> {
        let prompt = build_prompt(task, payload);
        let options = InvokeOptions {
            max_turns: task.max_turns,
            max_spend_usd: task.max_spend_usd,
        };

        let (status, summary, error) =
            match self.orchestrator.submit(&session.id, &prompt, options).await {
                Ok(handle) => match handle.wait().await {
                    QueryOutcome::Completed { summary, .. } => {
                        (RunStatus::Completed, summary, None)
                    }
                    QueryOutcome::Failed { error } => (RunStatus::Failed, None, Some(error)),
                    QueryOutcome::Interrupted { summary } => {
                        (RunStatus::Interrupted, summary, None)
                    }
                    QueryOutcome::Closed => (
                        RunStatus::Interrupted,
                        None,
                        Some("invocation was closed".to_string()),
                    ),
                },
                Err(e) => (RunStatus::Failed, None, Some(e.to_string())),
            };

        self.store
            .finish_task_run(&run.id, status, summary.as_deref(), error.as_deref())
            .await?;
        self.store
            .get_task_run(&run.id)
            .await?
            .ok_or_else(|| HubError::not_found(format!("run {}", run.id)))
    }

    async fn resolve_session(&self, task: &Task) -> HubResult<Session> {
        let working_dir = self.working_dir.to_string_lossy().to_string();
        match task.session_policy {
            SessionPolicy::NewSession => {
                let name = format!("{} {}", task.name, Utc::now().format("%Y-%m-%d"));
                self.store.create_session(&name, &working_dir).await
            }
            SessionPolicy::ReuseSession => {
                if let Some(session_id) = &task.session_id
                    && let Some(session) = self.store.get_session(session_id).await?
                {
                    return Ok(session);
                }
                let session = self.store.create_session(&task.name, &working_dir).await?;
                self.store.set_task_session(&task.id, &session.id).await?;
                info!(
                    "Task '{}' now reuses new session {}",
                    task.name, session.id
                );
                Ok(session)
            }
        }
    }

    // --- Lifecycle ---

    async fn start(&self) -> Result<()> {
        let stale = self.store.interrupt_stale_task_runs().await?;
        if stale > 0 {
            warn!("Marked {} stale task run(s) as interrupted", stale);
        }
        let tasks = self.store.list_enabled_cron_tasks().await?;
        for task in &tasks {
            if let Err(e) = self.sync_timer(task).await {
                error!("Could not schedule task '{}': {}", task.name, e);
            }
        }
        self.scheduler.start().await?;
        info!("Task scheduler started with {} cron task(s)", tasks.len());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut timers = self.timers.lock().await;
            let ids: Vec<String> = timers.keys().cloned().collect();
            for id in ids {
                self.uninstall_locked(&mut timers, &id).await;
            }
        }
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for TaskScheduler {
    fn name(&self) -> &'static str {
        "tasks"
    }

    async fn on_start(&self) -> Result<()> {
        self.start().await
    }

    async fn on_shutdown(&self) -> Result<()> {
        self.stop().await
    }
}

fn build_prompt(task: &Task, payload: Option<&Value>) -> String {
    match payload {
        Some(payload) => {
            let body = serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string());
            format!("{}\n\n--- Webhook Payload ---\n{}", task.prompt, body)
        }
        None => task.prompt.clone(),
    }
}

pub(crate) fn is_valid_webhook_path(path: &str) -> bool {
    !path.is_empty()
        && path.len() <= 128
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn generate_webhook_path() -> String {
    let bytes: [u8; 8] = rand::random();
    format!("hook-{}", hex::encode(bytes))
}

#[cfg(test)]
mod tests;
