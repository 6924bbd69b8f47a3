use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::types::{DbEnum, RunStatus, TaskRun, TriggerKind, enum_column, opt_json_column};
use super::{Store, now_ts};
use crate::core::error::HubResult;

const RUN_COLUMNS: &str = "id, task_id, session_id, status, trigger, trigger_payload, \
     started_at, finished_at, error, summary";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    Ok(TaskRun {
        id: row.get(0)?,
        task_id: row.get(1)?,
        session_id: row.get(2)?,
        status: enum_column(row, 3)?,
        trigger: enum_column(row, 4)?,
        trigger_payload: opt_json_column(row, 5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        error: row.get(8)?,
        summary: row.get(9)?,
    })
}

impl Store {
    pub async fn create_task_run(
        &self,
        task_id: &str,
        session_id: &str,
        trigger: TriggerKind,
        payload: Option<&Value>,
    ) -> HubResult<TaskRun> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let raw = payload.map(serde_json::to_string).transpose()?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO task_runs (id, task_id, session_id, status, trigger, trigger_payload, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6)",
            params![id, task_id, session_id, trigger.as_str(), raw, now],
        )?;
        Ok(TaskRun {
            id,
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            status: RunStatus::Running,
            trigger,
            trigger_payload: payload.cloned(),
            started_at: now,
            finished_at: None,
            error: None,
            summary: None,
        })
    }

    /// Set the terminal status of a run. Only a running run can be finished,
    /// so the first terminal status wins.
    pub async fn finish_task_run(
        &self,
        id: &str,
        status: RunStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> HubResult<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE task_runs SET status = ?2, summary = ?3, error = ?4, finished_at = ?5
             WHERE id = ?1 AND status = 'running'",
            params![id, status.as_str(), summary, error, now_ts()],
        )?;
        Ok(updated > 0)
    }

    pub async fn get_task_run(&self, id: &str) -> HubResult<Option<TaskRun>> {
        let db = self.db.lock().await;
        let run = db
            .query_row(
                &format!("SELECT {} FROM task_runs WHERE id = ?1", RUN_COLUMNS),
                params![id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Most recent runs of a task first.
    pub async fn list_task_runs(&self, task_id: &str, limit: usize) -> HubResult<Vec<TaskRun>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM task_runs WHERE task_id = ?1 ORDER BY started_at DESC, rowid DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![task_id, limit as i64], run_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Runs still marked running belong to a previous process.
    pub async fn interrupt_stale_task_runs(&self) -> HubResult<usize> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE task_runs SET status = 'interrupted', error = 'interrupted by process restart',
                                  finished_at = ?1
             WHERE status = 'running'",
            params![now_ts()],
        )?;
        Ok(updated)
    }
}
