mod runs;

use serde_json::{Value, json};

use super::TaskDraft;

fn draft(value: Value) -> TaskDraft {
    serde_json::from_value(value).unwrap()
}

fn cron_draft(name: &str, expression: &str) -> TaskDraft {
    draft(json!({
        "name": name,
        "kind": "cron",
        "expression": expression,
        "prompt": "check the build",
    }))
}

fn webhook_draft(name: &str, path: Option<&str>, secret: Option<&str>) -> TaskDraft {
    draft(json!({
        "name": name,
        "kind": "webhook",
        "path": path,
        "secret": secret,
        "prompt": "triage the event",
    }))
}
