use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{DbEnum, Task, TaskKind, TaskTrigger, enum_column};
use super::{Store, now_ts};
use crate::core::error::{HubError, HubResult};

const TASK_COLUMNS: &str = "id, name, kind, cron_expr, timezone, webhook_path, webhook_secret, \
     prompt, session_policy, session_id, enabled, max_turns, max_spend_usd, created_at, updated_at";

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let kind: TaskKind = enum_column(row, 2)?;
    let trigger = match kind {
        TaskKind::Cron => {
            let expression: Option<String> = row.get(3)?;
            TaskTrigger::Cron {
                expression: expression.ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        Type::Null,
                        "cron task without expression".into(),
                    )
                })?,
                timezone: row
                    .get::<_, Option<String>>(4)?
                    .unwrap_or_else(|| "UTC".to_string()),
            }
        }
        TaskKind::Webhook => {
            let path: Option<String> = row.get(5)?;
            TaskTrigger::Webhook {
                path: path.ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        5,
                        Type::Null,
                        "webhook task without path".into(),
                    )
                })?,
                secret: row.get(6)?,
            }
        }
    };

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        trigger,
        prompt: row.get(7)?,
        session_policy: enum_column(row, 8)?,
        session_id: row.get(9)?,
        enabled: row.get::<_, i64>(10)? != 0,
        max_turns: row.get(11)?,
        max_spend_usd: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

/// Column values for the trigger half of a task row.
fn trigger_columns(
    trigger: &TaskTrigger,
) -> (
    Option<&str>,
    Option<&str>,
    Option<&str>,
    Option<&str>,
) {
    match trigger {
        TaskTrigger::Cron {
            expression,
            timezone,
        } => (Some(expression), Some(timezone), None, None),
        TaskTrigger::Webhook { path, secret } => (None, None, Some(path), secret.as_deref()),
    }
}

fn map_unique_violation(err: rusqlite::Error, task: &Task) -> HubError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            HubError::conflict(format!(
                "webhook path '{}' is already in use",
                task.webhook_path().unwrap_or_default()
            ))
        }
        _ => HubError::Persistence(err),
    }
}

impl Store {
    pub async fn insert_task(&self, task: &Task) -> HubResult<()> {
        let (cron_expr, timezone, path, secret) = trigger_columns(&task.trigger);
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO tasks (id, name, kind, cron_expr, timezone, webhook_path, webhook_secret,
                                prompt, session_policy, session_id, enabled, max_turns,
                                max_spend_usd, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                task.id,
                task.name,
                task.trigger.kind().as_str(),
                cron_expr,
                timezone,
                path,
                secret,
                task.prompt,
                task.session_policy.as_str(),
                task.session_id,
                task.enabled as i64,
                task.max_turns,
                task.max_spend_usd,
                task.created_at,
                task.updated_at,
            ],
        )
        .map_err(|e| map_unique_violation(e, task))?;
        Ok(())
    }

    /// Overwrite every mutable column of an existing task.
    pub async fn update_task(&self, task: &Task) -> HubResult<bool> {
        let (cron_expr, timezone, path, secret) = trigger_columns(&task.trigger);
        let db = self.db.lock().await;
        let updated = db
            .execute(
                "UPDATE tasks SET name = ?2, kind = ?3, cron_expr = ?4, timezone = ?5,
                                  webhook_path = ?6, webhook_secret = ?7, prompt = ?8,
                                  session_policy = ?9, session_id = ?10, enabled = ?11,
                                  max_turns = ?12, max_spend_usd = ?13, updated_at = ?14
                 WHERE id = ?1",
                params![
                    task.id,
                    task.name,
                    task.trigger.kind().as_str(),
                    cron_expr,
                    timezone,
                    path,
                    secret,
                    task.prompt,
                    task.session_policy.as_str(),
                    task.session_id,
                    task.enabled as i64,
                    task.max_turns,
                    task.max_spend_usd,
                    task.updated_at,
                ],
            )
            .map_err(|e| map_unique_violation(e, task))?;
        Ok(updated > 0)
    }

    pub async fn get_task(&self, id: &str) -> HubResult<Option<Task>> {
        let db = self.db.lock().await;
        let task = db
            .query_row(
                &format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS),
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub async fn require_task(&self, id: &str) -> HubResult<Task> {
        self.get_task(id)
            .await?
            .ok_or_else(|| HubError::not_found(format!("task {}", id)))
    }

    pub async fn list_tasks(&self) -> HubResult<Vec<Task>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM tasks ORDER BY created_at ASC",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map([], task_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn list_enabled_cron_tasks(&self) -> HubResult<Vec<Task>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM tasks WHERE kind = 'cron' AND enabled = 1 ORDER BY created_at ASC",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map([], task_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn delete_task(&self, id: &str) -> HubResult<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub async fn find_task_by_webhook_path(&self, path: &str) -> HubResult<Option<Task>> {
        let db = self.db.lock().await;
        let task = db
            .query_row(
                &format!(
                    "SELECT {} FROM tasks WHERE kind = 'webhook' AND webhook_path = ?1",
                    TASK_COLUMNS
                ),
                params![path],
                task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    /// Whether a webhook path is used by a task other than `except_id`.
    pub async fn webhook_path_taken(&self, path: &str, except_id: Option<&str>) -> HubResult<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM tasks WHERE webhook_path = ?1 AND (?2 IS NULL OR id != ?2)",
            params![path, except_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Pin the session a reuse-policy task runs in.
    pub async fn set_task_session(&self, id: &str, session_id: &str) -> HubResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE tasks SET session_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, session_id, now_ts()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::SessionPolicy;

    fn webhook_task(id: &str, path: &str) -> Task {
        let now = now_ts();
        Task {
            id: id.to_string(),
            name: format!("task {}", id),
            trigger: TaskTrigger::Webhook {
                path: path.to_string(),
                secret: Some("s3cret".to_string()),
            },
            prompt: "do it".to_string(),
            session_policy: SessionPolicy::NewSession,
            session_id: None,
            enabled: true,
            max_turns: Some(3),
            max_spend_usd: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn webhook_task_round_trips_with_secret() {
        let store = Store::open_in_memory().unwrap();
        store.insert_task(&webhook_task("t1", "deploys")).await.unwrap();

        let found = store
            .find_task_by_webhook_path("deploys")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "t1");
        assert_eq!(found.webhook_secret(), Some("s3cret"));
        assert_eq!(found.max_turns, Some(3));
        assert!(store.find_task_by_webhook_path("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_webhook_path_is_a_conflict() {
        let store = Store::open_in_memory().unwrap();
        store.insert_task(&webhook_task("t1", "deploys")).await.unwrap();
        assert!(store.webhook_path_taken("deploys", None).await.unwrap());
        assert!(!store.webhook_path_taken("deploys", Some("t1")).await.unwrap());

        let err = store
            .insert_task(&webhook_task("t2", "deploys"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));
    }

    #[tokio::test]
    async fn only_enabled_cron_tasks_are_listed_for_timers() {
        let store = Store::open_in_memory().unwrap();
        let mut cron = webhook_task("c1", "unused");
        cron.trigger = TaskTrigger::Cron {
            expression: "0 * * * * *".to_string(),
            timezone: "Europe/Berlin".to_string(),
        };
        store.insert_task(&cron).await.unwrap();

        let mut disabled = cron.clone();
        disabled.id = "c2".to_string();
        disabled.enabled = false;
        store.insert_task(&disabled).await.unwrap();
        store.insert_task(&webhook_task("w1", "hook")).await.unwrap();

        let listed = store.list_enabled_cron_tasks().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "c1");
        assert_eq!(listed[0].trigger, cron.trigger);
        assert_eq!(store.list_tasks().await.unwrap().len(), 3);
    }
}
