use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use serde_json::Value;

use super::types::{DbEnum, StreamEventKind, StreamEventRecord, enum_column, json_column};
use super::{Store, format_ts, now_ts};
use crate::core::error::HubResult;

fn stream_event_from_row(row: &Row<'_>) -> rusqlite::Result<StreamEventRecord> {
    Ok(StreamEventRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        kind: enum_column(row, 2)?,
        payload: json_column(row, 3)?,
        turn: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl Store {
    pub async fn append_stream_event(
        &self,
        session_id: &str,
        kind: StreamEventKind,
        payload: &Value,
        turn: u32,
    ) -> HubResult<StreamEventRecord> {
        let now = now_ts();
        let raw = serde_json::to_string(payload)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO stream_events (session_id, kind, payload, turn, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, kind.as_str(), raw, turn, now],
        )?;
        Ok(StreamEventRecord {
            id: db.last_insert_rowid(),
            session_id: session_id.to_string(),
            kind,
            payload: payload.clone(),
            turn,
            created_at: now,
        })
    }

    /// Events of a session in insertion order, optionally after a cursor id.
    pub async fn list_stream_events(
        &self,
        session_id: &str,
        after_id: Option<i64>,
        limit: usize,
    ) -> HubResult<Vec<StreamEventRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, session_id, kind, payload, turn, created_at
             FROM stream_events
             WHERE session_id = ?1 AND id > ?2
             ORDER BY id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![session_id, after_id.unwrap_or(0), limit as i64],
            stream_event_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Highest turn recorded for a session; 0 when it has none.
    pub async fn max_turn(&self, session_id: &str) -> HubResult<u32> {
        let db = self.db.lock().await;
        let turn: i64 = db.query_row(
            "SELECT COALESCE(MAX(turn), 0) FROM stream_events WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        Ok(turn as u32)
    }

    /// Whether an identical user message was recorded for the session since `since`.
    pub async fn has_recent_user_message(
        &self,
        session_id: &str,
        content: &str,
        since: DateTime<Utc>,
    ) -> HubResult<bool> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM stream_events
             WHERE session_id = ?1 AND kind = 'user'
               AND json_extract(payload, '$.content') = ?2
               AND created_at >= ?3",
            params![session_id, content, format_ts(since)],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
