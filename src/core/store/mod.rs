mod events;
mod mailbox;
mod runs;
mod scheduled;
mod sessions;
mod subscriptions;
mod tasks;
pub mod types;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::HubResult;
use crate::platform::{NativePlatform, Platform};

pub use types::*;

/// Durable state for sessions, stream events, mailboxes, tasks, runs,
/// scheduled events and subscriptions. Cheap to clone; every clone shares
/// the same connection.
#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    working_dir TEXT NOT NULL,
    continuation_token TEXT,
    resume_pending INTEGER NOT NULL DEFAULT 0,
    resume_seq INTEGER,
    created_at TEXT NOT NULL,
    last_active_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS stream_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    turn INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_stream_events_session ON stream_events(session_id, id);

CREATE TABLE IF NOT EXISTS mailbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mailbox_session_status ON mailbox(session_id, status, id);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    cron_expr TEXT,
    timezone TEXT,
    webhook_path TEXT UNIQUE,
    webhook_secret TEXT,
    prompt TEXT NOT NULL,
    session_policy TEXT NOT NULL,
    session_id TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    max_turns INTEGER,
    max_spend_usd REAL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_runs (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    session_id TEXT NOT NULL,
    status TEXT NOT NULL,
    trigger TEXT NOT NULL,
    trigger_payload TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    error TEXT,
    summary TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_runs_task ON task_runs(task_id, started_at);

CREATE TABLE IF NOT EXISTS scheduled_events (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    fire_at TEXT NOT NULL,
    payload TEXT NOT NULL,
    error TEXT,
    summary TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_scheduled_events_due ON scheduled_events(status, fire_at);

CREATE TABLE IF NOT EXISTS webhook_subscriptions (
    session_id TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (session_id, path)
);

CREATE TABLE IF NOT EXISTS query_subscriptions (
    subscriber TEXT NOT NULL,
    target TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (subscriber, target)
);
";

impl Store {
    /// Open (or create) the database file at `path`.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await?;
            NativePlatform::restrict_dir_permissions(parent);
        }

        let db = Connection::open(path)?;
        NativePlatform::restrict_file_permissions(path);
        db.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        db.busy_timeout(std::time::Duration::from_secs(5))?;
        db.execute_batch(SCHEMA)?;

        info!("Store opened at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }

    pub fn open_in_memory() -> HubResult<Self> {
        let db = Connection::open_in_memory()?;
        db.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
        })
    }
}

/// Timestamps are stored as RFC3339 UTC with fixed millisecond precision,
/// so lexical order matches chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}
