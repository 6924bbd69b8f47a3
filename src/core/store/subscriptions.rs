use rusqlite::params;

use super::types::WebhookSubscription;
use super::{Store, now_ts};
use crate::core::error::HubResult;

impl Store {
    /// Subscribe a session to a webhook path. Re-subscribing is a no-op.
    pub async fn add_webhook_subscription(&self, session_id: &str, path: &str) -> HubResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO webhook_subscriptions (session_id, path, created_at)
             VALUES (?1, ?2, ?3)",
            params![session_id, path, now_ts()],
        )?;
        Ok(())
    }

    pub async fn remove_webhook_subscription(&self, session_id: &str, path: &str) -> HubResult<bool> {
        let db = self.db.lock().await;
        let deleted = db.execute(
            "DELETE FROM webhook_subscriptions WHERE session_id = ?1 AND path = ?2",
            params![session_id, path],
        )?;
        Ok(deleted > 0)
    }

    pub async fn list_webhook_subscriptions(
        &self,
        session_id: &str,
    ) -> HubResult<Vec<WebhookSubscription>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT session_id, path, created_at FROM webhook_subscriptions
             WHERE session_id = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(WebhookSubscription {
                session_id: row.get(0)?,
                path: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub async fn webhook_subscribers(&self, path: &str) -> HubResult<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT session_id FROM webhook_subscriptions WHERE path = ?1 ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![path], |row| row.get::<_, String>(0))?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Ask to be told when `target` next finishes a query.
    pub async fn add_watch(&self, subscriber: &str, target: &str) -> HubResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT OR IGNORE INTO query_subscriptions (subscriber, target, created_at)
             VALUES (?1, ?2, ?3)",
            params![subscriber, target, now_ts()],
        )?;
        Ok(())
    }

    /// Remove and return every watcher of `target`. Watches are one-shot.
    pub async fn take_watchers(&self, target: &str) -> HubResult<Vec<String>> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        let watchers = {
            let mut stmt = tx.prepare(
                "SELECT subscriber FROM query_subscriptions WHERE target = ?1 ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map(params![target], |row| row.get::<_, String>(0))?;
            let mut results = Vec::new();
            for row in rows {
                results.push(row?);
            }
            results
        };
        tx.execute(
            "DELETE FROM query_subscriptions WHERE target = ?1",
            params![target],
        )?;
        tx.commit()?;
        Ok(watchers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn webhook_subscriptions_are_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.add_webhook_subscription("s1", "deploys").await.unwrap();
        store.add_webhook_subscription("s1", "deploys").await.unwrap();
        store.add_webhook_subscription("s2", "deploys").await.unwrap();

        assert_eq!(store.webhook_subscribers("deploys").await.unwrap().len(), 2);
        assert_eq!(store.list_webhook_subscriptions("s1").await.unwrap().len(), 1);

        assert!(store.remove_webhook_subscription("s1", "deploys").await.unwrap());
        assert_eq!(
            store.webhook_subscribers("deploys").await.unwrap(),
            vec!["s2".to_string()]
        );
    }

    #[tokio::test]
    async fn watchers_are_taken_once() {
        let store = Store::open_in_memory().unwrap();
        store.add_watch("a", "target").await.unwrap();
        store.add_watch("b", "target").await.unwrap();
        store.add_watch("a", "target").await.unwrap();

        let mut taken = store.take_watchers("target").await.unwrap();
        taken.sort();
        assert_eq!(taken, vec!["a".to_string(), "b".to_string()]);
        assert!(store.take_watchers("target").await.unwrap().is_empty());
    }
}
