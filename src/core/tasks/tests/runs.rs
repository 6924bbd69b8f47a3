use chrono::Utc;
use serde_json::json;

use super::{cron_draft, draft};
use crate::core::agent::scripted::{ScriptedBackend, Step};
use crate::core::store::{RunStatus, SessionPolicy, TriggerKind};
use crate::core::test_support::{Fixture, eventually};

#[tokio::test]
async fn new_session_policy_names_the_session_after_the_task() {
    let fx = Fixture::new();
    let tasks = fx.tasks().await;
    let task = tasks
        .create_task(cron_draft("Daily report", "0 9 * * *"))
        .await
        .unwrap();
    fx.backend.push_script(ScriptedBackend::reply("all green"));

    let run = tasks
        .execute_task(&task, TriggerKind::Manual, None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.summary.as_deref(), Some("all green"));
    assert!(run.finished_at.is_some());

    let session = fx.store.require_session(&run.session_id).await.unwrap();
    assert_eq!(
        session.name,
        format!("Daily report {}", Utc::now().format("%Y-%m-%d"))
    );
    assert_eq!(fx.backend.prompts(), vec!["check the build"]);
}

#[tokio::test]
async fn reuse_policy_recreates_a_deleted_session() {
    let fx = Fixture::new();
    let tasks = fx.tasks().await;
    let original = fx.session("fixed").await;
    let task = tasks
        .create_task(draft(json!({
            "name": "reuse",
            "kind": "cron",
            "expression": "0 * * * *",
            "prompt": "continue",
            "session_policy": "reuse_session",
            "session_id": original.id,
        })))
        .await
        .unwrap();
    assert_eq!(task.session_policy, SessionPolicy::ReuseSession);

    let run = tasks
        .execute_task(&task, TriggerKind::Manual, None)
        .await
        .unwrap();
    assert_eq!(run.session_id, original.id);

    fx.store.delete_session(&original.id).await.unwrap();
    let run = tasks
        .spawn_task(&task.id, TriggerKind::Manual, None)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert_ne!(run.session_id, original.id);

    let stored = fx.store.require_task(&task.id).await.unwrap();
    assert_eq!(stored.session_id.as_deref(), Some(run.session_id.as_str()));

    let store = fx.store.clone();
    let run_id = run.id.clone();
    eventually(|| {
        let store = store.clone();
        let run_id = run_id.clone();
        async move {
            store.get_task_run(&run_id).await.unwrap().unwrap().status == RunStatus::Completed
        }
    })
    .await;
}

#[tokio::test]
async fn run_outcomes_map_to_run_status() {
    let fx = Fixture::new();
    let tasks = fx.tasks().await;
    let task = tasks
        .create_task(draft(json!({
            "name": "limited",
            "kind": "cron",
            "expression": "0 * * * *",
            "prompt": "go",
            "max_turns": 1,
        })))
        .await
        .unwrap();

    fx.backend
        .push_script(vec![Step::Fail("backend exploded".into())]);
    let failed = tasks
        .execute_task(&task, TriggerKind::Cron, None)
        .await
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(failed.error.unwrap().contains("backend exploded"));

    let mut steps = ScriptedBackend::reply("first");
    steps.extend(ScriptedBackend::reply("second"));
    fx.backend.push_script(steps);
    let limited = tasks
        .execute_task(&task, TriggerKind::Cron, None)
        .await
        .unwrap();
    assert_eq!(limited.status, RunStatus::Interrupted);
    assert_eq!(fx.backend.calls()[1].max_turns, Some(1));

    let runs = fx.store.list_task_runs(&task.id, 10).await.unwrap();
    assert_eq!(runs.len(), 2);
}

#[tokio::test]
async fn webhook_payload_is_appended_to_the_prompt() {
    let fx = Fixture::new();
    let tasks = fx.tasks().await;
    let task = tasks
        .create_task(super::webhook_draft("hook", Some("gh"), None))
        .await
        .unwrap();

    let run = tasks
        .execute_task(&task, TriggerKind::Webhook, Some(json!({ "ref": "main" })))
        .await
        .unwrap();
    assert_eq!(run.trigger, TriggerKind::Webhook);
    assert_eq!(run.trigger_payload, Some(json!({ "ref": "main" })));

    let prompt = &fx.backend.prompts()[0];
    assert!(prompt.starts_with("triage the event\n\n--- Webhook Payload ---\n"));
    assert!(prompt.contains("\"ref\": \"main\""));
}

#[tokio::test]
async fn stale_runs_are_interrupted_at_startup() {
    let fx = Fixture::new();
    let tasks = fx.tasks().await;
    let task = tasks
        .create_task(cron_draft("stale", "0 * * * *"))
        .await
        .unwrap();
    let session = fx.session("s").await;
    let run = fx
        .store
        .create_task_run(&task.id, &session.id, TriggerKind::Cron, None)
        .await
        .unwrap();

    tasks.start().await.unwrap();
    let run = fx.store.get_task_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Interrupted);
    tasks.stop().await.unwrap();
}
