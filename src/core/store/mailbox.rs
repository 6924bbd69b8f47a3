use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;

use super::types::{DbEnum, MailboxEntry, MailboxKind, MailboxStatus, enum_column, json_column};
use super::{Store, format_ts, now_ts};
use crate::core::error::HubResult;

const MAILBOX_COLUMNS: &str = "id, session_id, kind, content, metadata, status, error, created_at";

fn mailbox_entry_from_row(row: &Row<'_>) -> rusqlite::Result<MailboxEntry> {
    Ok(MailboxEntry {
        id: row.get(0)?,
        session_id: row.get(1)?,
        kind: enum_column(row, 2)?,
        content: row.get(3)?,
        metadata: json_column(row, 4)?,
        status: enum_column(row, 5)?,
        error: row.get(6)?,
        created_at: row.get(7)?,
    })
}

impl Store {
    pub async fn push_mailbox_entry(
        &self,
        session_id: &str,
        kind: MailboxKind,
        content: &str,
        metadata: &Value,
    ) -> HubResult<MailboxEntry> {
        let now = now_ts();
        let raw = serde_json::to_string(metadata)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO mailbox (session_id, kind, content, metadata, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
            params![session_id, kind.as_str(), content, raw, now],
        )?;
        Ok(MailboxEntry {
            id: db.last_insert_rowid(),
            session_id: session_id.to_string(),
            kind,
            content: content.to_string(),
            metadata: metadata.clone(),
            status: MailboxStatus::Pending,
            error: None,
            created_at: now,
        })
    }

    /// Atomically move the oldest pending entry of a session to `processing`.
    pub async fn claim_next_mailbox_entry(
        &self,
        session_id: &str,
    ) -> HubResult<Option<MailboxEntry>> {
        let db = self.db.lock().await;
        let entry = db
            .query_row(
                &format!(
                    "UPDATE mailbox SET status = 'processing', updated_at = ?2
                     WHERE id = (
                         SELECT id FROM mailbox
                         WHERE session_id = ?1 AND status = 'pending'
                         ORDER BY id ASC LIMIT 1
                     ) AND status = 'pending'
                     RETURNING {}",
                    MAILBOX_COLUMNS
                ),
                params![session_id, now_ts()],
                mailbox_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Move a processing entry to a terminal status. Returns false when the
    /// entry was not processing.
    pub async fn finish_mailbox_entry(
        &self,
        id: i64,
        status: MailboxStatus,
        error: Option<&str>,
    ) -> HubResult<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE mailbox SET status = ?2, error = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![id, status.as_str(), error, now_ts()],
        )?;
        Ok(updated > 0)
    }

    pub async fn list_mailbox(
        &self,
        session_id: &str,
        status: Option<MailboxStatus>,
    ) -> HubResult<Vec<MailboxEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM mailbox
             WHERE session_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY id ASC",
            MAILBOX_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![session_id, status.map(|s| s.as_str())],
            mailbox_entry_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn has_recent_pending_entry(
        &self,
        session_id: &str,
        content: &str,
        since: DateTime<Utc>,
    ) -> HubResult<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM mailbox
             WHERE session_id = ?1 AND kind = 'chat' AND content = ?2
               AND status IN ('pending', 'processing') AND created_at >= ?3",
            params![session_id, content, format_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub async fn has_pending_mail(&self, session_id: &str) -> HubResult<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM mailbox WHERE session_id = ?1 AND status = 'pending'",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Sessions with at least one pending entry, oldest backlog first.
    pub async fn sessions_with_pending_mail(&self) -> HubResult<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT session_id FROM mailbox WHERE status = 'pending'
             GROUP BY session_id ORDER BY MIN(id) ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Entries left in `processing` by a previous process can never complete.
    pub async fn fail_processing_mailbox_entries(&self, reason: &str) -> HubResult<usize> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE mailbox SET status = 'failed', error = ?1, updated_at = ?2
             WHERE status = 'processing'",
            params![reason, now_ts()],
        )?;
        Ok(updated)
    }
}
