use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde_json::{Value, json};

use super::super::AppState;
use super::{ApiResult, page_limit};
use crate::core::error::HubResult;
use crate::core::store::{Task, TaskTrigger, TriggerKind};
use crate::core::tasks::cron_expr::next_fire;
use crate::core::tasks::{TaskDraft, TaskPatch};

/// Task as JSON, with `next_run` filled in for enabled cron tasks.
fn task_json(task: &Task) -> HubResult<Value> {
    let next_run = match &task.trigger {
        TaskTrigger::Cron {
            expression,
            timezone,
        } if task.enabled => next_fire(expression, timezone),
        _ => None,
    };
    let mut value = serde_json::to_value(task)?;
    if let Value::Object(map) = &mut value {
        map.insert("next_run".to_string(), serde_json::to_value(next_run)?);
    }
    Ok(value)
}

pub async fn list_tasks(State(state): State<AppState>) -> ApiResult {
    let tasks = state
        .hub
        .store
        .list_tasks()
        .await?
        .iter()
        .map(task_json)
        .collect::<HubResult<Vec<_>>>()?;
    Ok(Json(json!({ "success": true, "tasks": tasks })))
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(draft): Json<TaskDraft>,
) -> ApiResult {
    let task = state.hub.tasks.create_task(draft).await?;
    Ok(Json(json!({ "success": true, "task": task_json(&task)? })))
}

pub async fn get_task(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    let task = state.hub.store.require_task(&id).await?;
    Ok(Json(json!({ "success": true, "task": task_json(&task)? })))
}

pub async fn update_task(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(patch): Json<TaskPatch>,
) -> ApiResult {
    let task = state.hub.tasks.update_task(&id, patch).await?;
    Ok(Json(json!({ "success": true, "task": task_json(&task)? })))
}

pub async fn delete_task(Path(id): Path<String>, State(state): State<AppState>) -> ApiResult {
    state.hub.tasks.delete_task(&id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(serde::Deserialize, Default)]
pub struct RunTaskRequest {
    payload: Option<Value>,
}

/// Manual trigger. Returns as soon as the run is recorded.
pub async fn run_task(
    Path(id): Path<String>,
    State(state): State<AppState>,
    payload: Option<Json<RunTaskRequest>>,
) -> ApiResult {
    let request = payload.map(|Json(r)| r).unwrap_or_default();
    let run = state
        .hub
        .tasks
        .spawn_task(&id, TriggerKind::Manual, request.payload)
        .await?;
    Ok(Json(json!({ "success": true, "run": run })))
}

#[derive(serde::Deserialize)]
pub struct RunsQuery {
    limit: Option<usize>,
}

pub async fn list_runs(
    Path(id): Path<String>,
    Query(query): Query<RunsQuery>,
    State(state): State<AppState>,
) -> ApiResult {
    state.hub.store.require_task(&id).await?;
    let runs = state
        .hub
        .store
        .list_task_runs(&id, page_limit(query.limit))
        .await?;
    Ok(Json(json!({ "success": true, "runs": runs })))
}
