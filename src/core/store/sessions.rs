use rusqlite::{OptionalExtension, Row, params};

use super::types::Session;
use super::{Store, now_ts};
use crate::core::error::{HubError, HubResult};

const SESSION_COLUMNS: &str =
    "id, name, working_dir, continuation_token, resume_pending, created_at, last_active_at";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        working_dir: row.get(2)?,
        continuation_token: row.get(3)?,
        resume_pending: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
        last_active_at: row.get(6)?,
    })
}

impl Store {
    pub async fn create_session(&self, name: &str, working_dir: &str) -> HubResult<Session> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO sessions (id, name, working_dir, created_at, last_active_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, name, working_dir, now],
        )?;
        Ok(Session {
            id,
            name: name.to_string(),
            working_dir: working_dir.to_string(),
            continuation_token: None,
            resume_pending: false,
            created_at: now.clone(),
            last_active_at: now,
        })
    }

    pub async fn get_session(&self, id: &str) -> HubResult<Option<Session>> {
        let db = self.db.lock().await;
        let session = db
            .query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                params![id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    pub async fn require_session(&self, id: &str) -> HubResult<Session> {
        self.get_session(id)
            .await?
            .ok_or_else(|| HubError::not_found(format!("session {}", id)))
    }

    pub async fn list_sessions(&self) -> HubResult<Vec<Session>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM sessions ORDER BY last_active_at DESC",
            SESSION_COLUMNS
        ))?;
        let rows = stmt.query_map([], session_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn rename_session(&self, id: &str, name: &str) -> HubResult<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE sessions SET name = ?2 WHERE id = ?1",
            params![id, name],
        )?;
        Ok(updated > 0)
    }

    /// Remove a session together with its events, mailbox and subscriptions.
    pub async fn delete_session(&self, id: &str) -> HubResult<bool> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM stream_events WHERE session_id = ?1", params![id])?;
        tx.execute("DELETE FROM mailbox WHERE session_id = ?1", params![id])?;
        tx.execute(
            "DELETE FROM webhook_subscriptions WHERE session_id = ?1",
            params![id],
        )?;
        tx.execute(
            "DELETE FROM query_subscriptions WHERE subscriber = ?1 OR target = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }

    pub async fn set_continuation_token(&self, id: &str, token: &str) -> HubResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE sessions SET continuation_token = ?2, last_active_at = ?3 WHERE id = ?1",
            params![id, token, now_ts()],
        )?;
        Ok(())
    }

    pub async fn touch_session(&self, id: &str) -> HubResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE sessions SET last_active_at = ?2 WHERE id = ?1",
            params![id, now_ts()],
        )?;
        Ok(())
    }

    /// Durably mark sessions as needing resurrection, preserving the given order.
    pub async fn flag_sessions_for_resume(&self, ids: &[String]) -> HubResult<usize> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let mut flagged = 0;
        for id in ids {
            flagged += tx.execute(
                "UPDATE sessions
                 SET resume_pending = 1,
                     resume_seq = (SELECT COALESCE(MAX(resume_seq), 0) + 1 FROM sessions)
                 WHERE id = ?1",
                params![id],
            )?;
        }
        tx.commit()?;
        Ok(flagged)
    }

    /// Return the flagged sessions in flag order and clear their flags in the
    /// same transaction, so a crash mid-resurrection never resumes twice.
    pub async fn take_resume_flags(&self) -> HubResult<Vec<Session>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let sessions = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM sessions WHERE resume_pending = 1 ORDER BY resume_seq, id",
                SESSION_COLUMNS
            ))?;
            let rows = stmt.query_map([], session_from_row)?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            results
        };
        tx.execute(
            "UPDATE sessions SET resume_pending = 0, resume_seq = NULL WHERE resume_pending = 1",
            [],
        )?;
        tx.commit()?;
        Ok(sessions)
    }
}
