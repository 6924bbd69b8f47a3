use chrono::{DateTime, Utc};
use rusqlite::Row;
use rusqlite::types::Type;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Enums persisted as TEXT columns.
pub trait DbEnum: Sized {
    fn as_str(&self) -> &'static str;
    fn parse(value: &str) -> Option<Self>;
}

pub(crate) fn enum_column<T: DbEnum>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    T::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown value '{}'", raw).into(),
        )
    })
}

pub(crate) fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))),
        None => Ok(None),
    }
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// --- Sessions ---

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    pub continuation_token: Option<String>,
    pub resume_pending: bool,
    pub created_at: String,
    pub last_active_at: String,
}

// --- Stream events ---

/// Kind tag of an item yielded by the agent backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    System,
    Assistant,
    User,
    Result,
    Error,
    Other,
}

impl DbEnum for StreamEventKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamEventKind::System => "system",
            StreamEventKind::Assistant => "assistant",
            StreamEventKind::User => "user",
            StreamEventKind::Result => "result",
            StreamEventKind::Error => "error",
            StreamEventKind::Other => "other",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(StreamEventKind::System),
            "assistant" => Some(StreamEventKind::Assistant),
            "user" => Some(StreamEventKind::User),
            "result" => Some(StreamEventKind::Result),
            "error" => Some(StreamEventKind::Error),
            "other" => Some(StreamEventKind::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamEventRecord {
    pub id: i64,
    pub session_id: String,
    pub kind: StreamEventKind,
    pub payload: Value,
    pub turn: u32,
    pub created_at: String,
}

// --- Mailbox ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxKind {
    /// Authored by a user through the API or a listener.
    Chat,
    /// Synthesized by the hub itself (resurrection prompts).
    System,
    Webhook,
    /// Completion notice for a watched session.
    Watch,
}

impl DbEnum for MailboxKind {
    fn as_str(&self) -> &'static str {
        match self {
            MailboxKind::Chat => "chat",
            MailboxKind::System => "system",
            MailboxKind::Webhook => "webhook",
            MailboxKind::Watch => "watch",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "chat" => Some(MailboxKind::Chat),
            "system" => Some(MailboxKind::System),
            "webhook" => Some(MailboxKind::Webhook),
            "watch" => Some(MailboxKind::Watch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl DbEnum for MailboxStatus {
    fn as_str(&self) -> &'static str {
        match self {
            MailboxStatus::Pending => "pending",
            MailboxStatus::Processing => "processing",
            MailboxStatus::Delivered => "delivered",
            MailboxStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(MailboxStatus::Pending),
            "processing" => Some(MailboxStatus::Processing),
            "delivered" => Some(MailboxStatus::Delivered),
            "failed" => Some(MailboxStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MailboxEntry {
    pub id: i64,
    pub session_id: String,
    pub kind: MailboxKind,
    pub content: String,
    pub metadata: Value,
    pub status: MailboxStatus,
    pub error: Option<String>,
    pub created_at: String,
}

// --- Tasks ---

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTrigger {
    Cron {
        expression: String,
        timezone: String,
    },
    Webhook {
        path: String,
        #[serde(skip_serializing)]
        secret: Option<String>,
    },
}

impl TaskTrigger {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskTrigger::Cron { .. } => TaskKind::Cron,
            TaskTrigger::Webhook { .. } => TaskKind::Webhook,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Cron,
    Webhook,
}

impl DbEnum for TaskKind {
    fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Cron => "cron",
            TaskKind::Webhook => "webhook",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "cron" => Some(TaskKind::Cron),
            "webhook" => Some(TaskKind::Webhook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    NewSession,
    ReuseSession,
}

impl DbEnum for SessionPolicy {
    fn as_str(&self) -> &'static str {
        match self {
            SessionPolicy::NewSession => "new_session",
            SessionPolicy::ReuseSession => "reuse_session",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "new_session" => Some(SessionPolicy::NewSession),
            "reuse_session" => Some(SessionPolicy::ReuseSession),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub trigger: TaskTrigger,
    pub prompt: String,
    pub session_policy: SessionPolicy,
    pub session_id: Option<String>,
    pub enabled: bool,
    pub max_turns: Option<u32>,
    pub max_spend_usd: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    pub fn webhook_path(&self) -> Option<&str> {
        match &self.trigger {
            TaskTrigger::Webhook { path, .. } => Some(path),
            TaskTrigger::Cron { .. } => None,
        }
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        match &self.trigger {
            TaskTrigger::Webhook { secret, .. } => secret.as_deref(),
            TaskTrigger::Cron { .. } => None,
        }
    }
}

// --- Task runs ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl DbEnum for RunStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Interrupted => "interrupted",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "interrupted" => Some(RunStatus::Interrupted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Cron,
    Webhook,
    Manual,
    Scheduled,
}

impl DbEnum for TriggerKind {
    fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Cron => "cron",
            TriggerKind::Webhook => "webhook",
            TriggerKind::Manual => "manual",
            TriggerKind::Scheduled => "scheduled",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "cron" => Some(TriggerKind::Cron),
            "webhook" => Some(TriggerKind::Webhook),
            "manual" => Some(TriggerKind::Manual),
            "scheduled" => Some(TriggerKind::Scheduled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRun {
    pub id: String,
    pub task_id: String,
    pub session_id: String,
    pub status: RunStatus,
    pub trigger: TriggerKind,
    pub trigger_payload: Option<Value>,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub error: Option<String>,
    pub summary: Option<String>,
}

// --- Scheduled events ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl DbEnum for EventStatus {
    fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Running => "running",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EventStatus::Pending),
            "running" => Some(EventStatus::Running),
            "completed" => Some(EventStatus::Completed),
            "failed" => Some(EventStatus::Failed),
            "cancelled" => Some(EventStatus::Cancelled),
            _ => None,
        }
    }
}

/// What a scheduled event does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduledAction {
    Task { task_id: String },
    Webhook { path: String, payload: Value },
    Message { session_id: String, content: String },
}

impl ScheduledAction {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ScheduledAction::Task { .. } => "task",
            ScheduledAction::Webhook { .. } => "webhook",
            ScheduledAction::Message { .. } => "message",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledEvent {
    pub id: String,
    pub action: ScheduledAction,
    pub status: EventStatus,
    pub fire_at: DateTime<Utc>,
    pub error: Option<String>,
    pub summary: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// --- Subscriptions ---

#[derive(Debug, Clone, Serialize)]
pub struct WebhookSubscription {
    pub session_id: String,
    pub path: String,
    pub created_at: String,
}
