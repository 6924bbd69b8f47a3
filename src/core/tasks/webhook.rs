use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::Sha256;
use tracing::{info, warn};

use super::TaskScheduler;
use crate::core::error::{HubError, HubResult};
use crate::core::orchestrator::InboundMessage;
use crate::core::scheduled::fire_after_delay;
use crate::core::store::{MailboxKind, ScheduledAction, ScheduledEvent, TaskRun, TriggerKind};

type HmacSha256 = Hmac<Sha256>;

/// An inbound `POST /hooks/{path}` call, already stripped of HTTP types.
#[derive(Debug, Clone, Default)]
pub struct WebhookCall {
    pub path: String,
    /// Token from `Authorization: Bearer ...`.
    pub bearer: Option<String>,
    /// `X-Hub-Signature-256` header value.
    pub hub_signature: Option<String>,
    /// `X-Signature` header value.
    pub signature: Option<String>,
    pub raw_body: String,
    pub payload: Value,
}

/// What an immediate webhook dispatch did.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookDispatch {
    pub run: Option<TaskRun>,
    pub delivered_to: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Dispatched(WebhookDispatch),
    Scheduled(ScheduledEvent),
}

impl TaskScheduler {
    pub async fn deliver_webhook(&self, call: WebhookCall) -> HubResult<WebhookOutcome> {
        let task = self
            .store
            .find_task_by_webhook_path(&call.path)
            .await?
            .filter(|task| task.enabled);
        let subscribers = self.store.webhook_subscribers(&call.path).await?;
        if task.is_none() && subscribers.is_empty() {
            return Err(HubError::not_found(format!("webhook '{}'", call.path)));
        }

        if let Some(secret) = task.as_ref().and_then(|t| t.webhook_secret())
            && !verify_secret(&call, secret)
        {
            warn!("Rejected webhook call to '{}': bad credentials", call.path);
            return Err(HubError::Unauthorized(
                "missing or invalid webhook credentials".to_string(),
            ));
        }

        if let Some(fire_at) = requested_fire_time(&call.payload)? {
            let action = ScheduledAction::Webhook {
                path: call.path.clone(),
                payload: strip_schedule_fields(call.payload),
            };
            let event = self.store.insert_scheduled_event(&action, fire_at).await?;
            info!(
                "Webhook '{}' deferred to {} as event {}",
                call.path, event.fire_at, event.id
            );
            return Ok(WebhookOutcome::Scheduled(event));
        }

        let dispatch = self.dispatch_webhook(&call.path, call.payload).await?;
        Ok(WebhookOutcome::Dispatched(dispatch))
    }

    /// Start the path's task in the background and hand the payload to every
    /// subscribed session. No credential checks; callers have done them.
    pub async fn dispatch_webhook(&self, path: &str, payload: Value) -> HubResult<WebhookDispatch> {
        let task = self
            .store
            .find_task_by_webhook_path(path)
            .await?
            .filter(|task| task.enabled);
        let subscribers = self.store.webhook_subscribers(path).await?;
        if task.is_none() && subscribers.is_empty() {
            return Err(HubError::not_found(format!("webhook '{}'", path)));
        }

        let run = match task {
            Some(task) => Some(
                self.spawn_task(&task.id, TriggerKind::Webhook, Some(payload.clone()))
                    .await?,
            ),
            None => None,
        };

        let content = format!(
            "[webhook:{}]\n{}",
            path,
            serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
        );
        let mut delivered_to = Vec::with_capacity(subscribers.len());
        for session_id in subscribers {
            let message = InboundMessage {
                session_id: session_id.clone(),
                kind: MailboxKind::Webhook,
                content: content.clone(),
                metadata: json!({ "path": path, "payload": payload }),
            };
            match self.orchestrator.deliver(message).await {
                Ok(_) => delivered_to.push(session_id),
                Err(e) => warn!(
                    "Webhook '{}' could not reach session {}: {}",
                    path, session_id, e
                ),
            }
        }

        info!(
            "Webhook '{}' dispatched (task run: {}, subscribers: {})",
            path,
            run.as_ref().map(|r| r.id.as_str()).unwrap_or("none"),
            delivered_to.len()
        );
        Ok(WebhookDispatch { run, delivered_to })
    }
}

fn verify_secret(call: &WebhookCall, secret: &str) -> bool {
    if let Some(token) = &call.bearer {
        return constant_time_eq(token.as_bytes(), secret.as_bytes());
    }

    // GitHub style: sha256=<hex>
    if let Some(hex_sig) = call
        .hub_signature
        .as_deref()
        .and_then(|sig| sig.strip_prefix("sha256="))
    {
        return signature_matches(hex_sig, &call.raw_body, secret);
    }

    // Raw HMAC-SHA256 hex
    if let Some(sig) = &call.signature {
        return signature_matches(sig, &call.raw_body, secret);
    }

    false
}

fn signature_matches(hex_sig: &str, body: &str, secret: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(hex_sig.to_ascii_lowercase().as_bytes(), expected.as_bytes())
}

/// Compare secrets without an early exit on the first differing byte.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// `delay_seconds` (relative) wins over `deliver_at` (RFC 3339).
fn requested_fire_time(payload: &Value) -> HubResult<Option<DateTime<Utc>>> {
    if let Some(delay) = payload.get("delay_seconds") {
        let seconds = delay
            .as_f64()
            .ok_or_else(|| HubError::validation("delay_seconds must be a non-negative number"))?;
        return fire_after_delay(seconds).map(Some);
    }
    if let Some(at) = payload.get("deliver_at") {
        let raw = at
            .as_str()
            .ok_or_else(|| HubError::validation("deliver_at must be an RFC 3339 string"))?;
        let fire_at = DateTime::parse_from_rfc3339(raw)
            .map_err(|e| HubError::validation(format!("invalid deliver_at '{}': {}", raw, e)))?;
        return Ok(Some(fire_at.with_timezone(&Utc)));
    }
    Ok(None)
}

fn strip_schedule_fields(payload: Value) -> Value {
    match payload {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| key != "delay_seconds" && key != "deliver_at")
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sign(body: &str, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn bearer_and_signatures_are_checked() {
        let body = r#"{"a":1}"#;
        let mut call = WebhookCall {
            raw_body: body.to_string(),
            ..Default::default()
        };
        assert!(!verify_secret(&call, "s3cret"));

        call.bearer = Some("s3cret".into());
        assert!(verify_secret(&call, "s3cret"));
        call.bearer = Some("wrong".into());
        assert!(!verify_secret(&call, "s3cret"));

        call.bearer = None;
        call.hub_signature = Some(format!("sha256={}", sign(body, "s3cret")));
        assert!(verify_secret(&call, "s3cret"));
        call.raw_body = r#"{"a":2}"#.into();
        assert!(!verify_secret(&call, "s3cret"));

        call.hub_signature = None;
        call.signature = Some(sign(&call.raw_body, "s3cret"));
        assert!(verify_secret(&call, "s3cret"));
    }

    #[test]
    fn constant_time_eq_needs_identical_bytes() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokeN"));
        assert!(!constant_time_eq(b"token", b"token2"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn schedule_fields_are_read_and_stripped() {
        let payload = json!({ "delay_seconds": 60, "event": "push" });
        let fire_at = requested_fire_time(&payload).unwrap().unwrap();
        let delta = fire_at - Utc::now();
        assert!(delta > Duration::seconds(55) && delta <= Duration::seconds(60));
        assert_eq!(strip_schedule_fields(payload), json!({ "event": "push" }));

        let at = json!({ "deliver_at": "2030-01-01T00:00:00Z" });
        assert_eq!(
            requested_fire_time(&at).unwrap().unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );

        assert!(requested_fire_time(&json!({ "event": "push" })).unwrap().is_none());
        assert!(requested_fire_time(&json!({ "delay_seconds": -1 })).is_err());
        assert!(matches!(
            requested_fire_time(&json!({ "delay_seconds": 1e15 })),
            Err(HubError::Validation(_))
        ));
        assert!(requested_fire_time(&json!({ "deliver_at": "tomorrow" })).is_err());
    }
}
