//! REST handlers for task commands.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AppState;
use crate::error::{AppError, AppResult};
use crate::types::{CreateTaskRequest, Task, TaskLog, TaskPatch, TaskStatus};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn create_task(
    State(state): State<AppState>,
    Json(req): Json<CreateTaskRequest>,
) -> AppResult<(StatusCode, Json<Task>)> {
    let task = state.db.create_task(&req)?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn create_tasks_batch(
    State(state): State<AppState>,
    Json(reqs): Json<Vec<CreateTaskRequest>>,
) -> AppResult<(StatusCode, Json<Vec<Task>>)> {
    let tasks = state.db.create_tasks_batch(&reqs)?;
    Ok((StatusCode::CREATED, Json(tasks)))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    status: Option<String>,
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListTasksParams>,
) -> AppResult<Json<Vec<Task>>> {
    let status = match params.status.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(
            TaskStatus::from_str(s)
                .ok_or_else(|| AppError::validation(format!("unknown status: {}", s)))?,
        ),
        None => None,
    };
    Ok(Json(state.db.list_tasks(status)?))
}

/// A task together with its ordered log entries.
#[derive(Debug, Serialize)]
pub struct TaskWithLogs {
    pub task: Task,
    pub logs: Vec<TaskLog>,
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<TaskWithLogs>> {
    let task = state
        .db
        .get_task(task_id)?
        .ok_or_else(|| AppError::task_not_found(task_id))?;
    let logs = state.db.get_task_logs(task_id)?;
    Ok(Json(TaskWithLogs { task, logs }))
}

pub async fn get_task_logs(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<Vec<TaskLog>>> {
    state
        .db
        .get_task(task_id)?
        .ok_or_else(|| AppError::task_not_found(task_id))?;
    Ok(Json(state.db.get_task_logs(task_id)?))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<Value>> {
    let task = state
        .db
        .get_task(task_id)?
        .ok_or_else(|| AppError::task_not_found(task_id))?;

    match task.status {
        TaskStatus::Pending => {
            state.db.update_task(
                task_id,
                TaskPatch {
                    status: Some(TaskStatus::Cancelled),
                    ..Default::default()
                },
            )?;
            state.hub.broadcast_state(task_id, TaskStatus::Cancelled);
            Ok(Json(json!({ "status": "cancelled" })))
        }
        TaskStatus::InProgress => {
            // The executor kills the child and writes the terminal state
            // after the output stream has drained.
            state.executor.cancel(task_id);
            Ok(Json(json!({ "status": "cancelling" })))
        }
        other => Err(AppError::state_conflict(other, TaskStatus::Cancelled)),
    }
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<Task>> {
    let task = state.db.retry_task(task_id)?;
    state.hub.broadcast_state(task_id, TaskStatus::Pending);
    Ok(Json(task))
}

pub async fn approve_plan(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<Task>> {
    let task = state.db.approve_plan(task_id)?;
    state.hub.broadcast_state(task_id, TaskStatus::Pending);
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<i64>,
) -> AppResult<Json<Value>> {
    state.db.delete_task(task_id)?;
    Ok(Json(json!({ "status": "deleted" })))
}
