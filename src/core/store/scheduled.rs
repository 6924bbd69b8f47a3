use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{
    DbEnum, EventStatus, ScheduledAction, ScheduledEvent, enum_column, time_column,
};
use super::{Store, format_ts, now_ts};
use crate::core::error::{HubError, HubResult};

const EVENT_COLUMNS: &str = "id, payload, status, fire_at, error, summary, created_at, updated_at";

fn scheduled_event_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledEvent> {
    let raw: String = row.get(1)?;
    let action: ScheduledAction = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    Ok(ScheduledEvent {
        id: row.get(0)?,
        action,
        status: enum_column(row, 2)?,
        fire_at: time_column(row, 3)?,
        error: row.get(4)?,
        summary: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl Store {
    pub async fn insert_scheduled_event(
        &self,
        action: &ScheduledAction,
        fire_at: DateTime<Utc>,
    ) -> HubResult<ScheduledEvent> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_ts();
        let raw = serde_json::to_string(action)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO scheduled_events (id, kind, status, fire_at, payload, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)",
            params![id, action.kind_str(), format_ts(fire_at), raw, now],
        )?;
        Ok(ScheduledEvent {
            id,
            action: action.clone(),
            status: EventStatus::Pending,
            fire_at,
            error: None,
            summary: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub async fn get_scheduled_event(&self, id: &str) -> HubResult<Option<ScheduledEvent>> {
        let db = self.db.lock().await;
        let event = db
            .query_row(
                &format!("SELECT {} FROM scheduled_events WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                scheduled_event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    pub async fn list_scheduled_events(
        &self,
        status: Option<EventStatus>,
        limit: usize,
    ) -> HubResult<Vec<ScheduledEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM scheduled_events
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY fire_at ASC LIMIT ?2",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![status.map(|s| s.as_str()), limit as i64],
            scheduled_event_from_row,
        )?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Resolve a zero-row update on a pending-only statement into the right error.
    async fn pending_guard_error(&self, id: &str) -> HubError {
        match self.get_scheduled_event(id).await {
            Ok(Some(event)) => HubError::conflict(format!(
                "event {} is {} and can no longer be changed",
                id,
                event.status.as_str()
            )),
            Ok(None) => HubError::not_found(format!("event {}", id)),
            Err(e) => e,
        }
    }

    /// Change the action and/or fire time of a pending event.
    pub async fn update_pending_event(
        &self,
        id: &str,
        action: Option<&ScheduledAction>,
        fire_at: Option<DateTime<Utc>>,
    ) -> HubResult<ScheduledEvent> {
        let kind = action.map(|a| a.kind_str());
        let raw = action.map(serde_json::to_string).transpose()?;
        let fire_at = fire_at.map(format_ts);
        let updated = {
            let db = self.db.lock().await;
            db.execute(
                "UPDATE scheduled_events
                 SET kind = COALESCE(?2, kind), payload = COALESCE(?3, payload),
                     fire_at = COALESCE(?4, fire_at), updated_at = ?5
                 WHERE id = ?1 AND status = 'pending'",
                params![id, kind, raw, fire_at, now_ts()],
            )?
        };
        if updated == 0 {
            return Err(self.pending_guard_error(id).await);
        }
        self.get_scheduled_event(id)
            .await?
            .ok_or_else(|| HubError::not_found(format!("event {}", id)))
    }

    pub async fn cancel_pending_event(&self, id: &str) -> HubResult<ScheduledEvent> {
        let updated = {
            let db = self.db.lock().await;
            db.execute(
                "UPDATE scheduled_events SET status = 'cancelled', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'",
                params![id, now_ts()],
            )?
        };
        if updated == 0 {
            return Err(self.pending_guard_error(id).await);
        }
        self.get_scheduled_event(id)
            .await?
            .ok_or_else(|| HubError::not_found(format!("event {}", id)))
    }

    /// Pending events whose fire time is at or before `now`, oldest first.
    pub async fn due_scheduled_events(&self, now: DateTime<Utc>) -> HubResult<Vec<ScheduledEvent>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM scheduled_events
             WHERE status = 'pending' AND fire_at <= ?1
             ORDER BY fire_at ASC",
            EVENT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![format_ts(now)], scheduled_event_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Move a pending event to running. False means another poller (or a
    /// cancel) got there first and the event must be skipped.
    pub async fn claim_scheduled_event(&self, id: &str) -> HubResult<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE scheduled_events SET status = 'running', updated_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now_ts()],
        )?;
        Ok(updated == 1)
    }

    pub async fn finish_scheduled_event(
        &self,
        id: &str,
        status: EventStatus,
        summary: Option<&str>,
        error: Option<&str>,
    ) -> HubResult<bool> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE scheduled_events SET status = ?2, summary = ?3, error = ?4, updated_at = ?5
             WHERE id = ?1 AND status = 'running'",
            params![id, status.as_str(), summary, error, now_ts()],
        )?;
        Ok(updated > 0)
    }

    /// Events left running by a previous process.
    pub async fn fail_running_events(&self, reason: &str) -> HubResult<usize> {
        let db = self.db.lock().await;
        let updated = db.execute(
            "UPDATE scheduled_events SET status = 'failed', error = ?1, updated_at = ?2
             WHERE status = 'running'",
            params![reason, now_ts()],
        )?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn message(content: &str) -> ScheduledAction {
        ScheduledAction::Message {
            session_id: "s1".to_string(),
            content: content.to_string(),
        }
    }

    #[tokio::test]
    async fn only_due_pending_events_are_returned() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let due = store
            .insert_scheduled_event(&message("due"), now - Duration::seconds(1))
            .await
            .unwrap();
        store
            .insert_scheduled_event(&message("later"), now + Duration::hours(1))
            .await
            .unwrap();

        let found = store.due_scheduled_events(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
        assert_eq!(found[0].action, message("due"));
    }

    #[tokio::test]
    async fn claim_succeeds_exactly_once() {
        let store = Store::open_in_memory().unwrap();
        let event = store
            .insert_scheduled_event(&message("x"), Utc::now())
            .await
            .unwrap();

        assert!(store.claim_scheduled_event(&event.id).await.unwrap());
        assert!(!store.claim_scheduled_event(&event.id).await.unwrap());

        assert!(
            store
                .finish_scheduled_event(&event.id, EventStatus::Completed, Some("ok"), None)
                .await
                .unwrap()
        );
        let stored = store.get_scheduled_event(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn update_and_cancel_only_touch_pending_events() {
        let store = Store::open_in_memory().unwrap();
        let event = store
            .insert_scheduled_event(&message("x"), Utc::now())
            .await
            .unwrap();

        let later = Utc::now() + Duration::minutes(5);
        let updated = store
            .update_pending_event(&event.id, Some(&message("y")), Some(later))
            .await
            .unwrap();
        assert_eq!(updated.action, message("y"));
        assert_eq!(format_ts(updated.fire_at), format_ts(later));

        let cancelled = store.cancel_pending_event(&event.id).await.unwrap();
        assert_eq!(cancelled.status, EventStatus::Cancelled);

        assert!(matches!(
            store.cancel_pending_event(&event.id).await,
            Err(HubError::Conflict(_))
        ));
        assert!(matches!(
            store.update_pending_event("missing", None, Some(later)).await,
            Err(HubError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn running_events_fail_on_restart() {
        let store = Store::open_in_memory().unwrap();
        let event = store
            .insert_scheduled_event(&message("x"), Utc::now())
            .await
            .unwrap();
        store.claim_scheduled_event(&event.id).await.unwrap();

        assert_eq!(
            store
                .fail_running_events("interrupted by process restart")
                .await
                .unwrap(),
            1
        );
        let stored = store.get_scheduled_event(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
        assert_eq!(
            stored.error.as_deref(),
            Some("interrupted by process restart")
        );
    }
}
