//! The HTTP control API: a thin CRUD surface over the Store plus a
//! "trigger now" endpoint that reaches into the live Scheduler.

use crate::error::SchedulerError;
use crate::job::Job;
use crate::scheduler::SchedulerHandle;
use crate::store::Store;
use crate::task::{NewTask, Task, TaskDefinition};
use crate::time::{Clock, RealClock};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn Store>,
    pub scheduler: SchedulerHandle,
}

/// Wraps [`SchedulerError`] so it can implement `IntoResponse` without
/// pulling `axum` into the core error type — the HTTP status mapping is a
/// property of this layer, not the engine.
pub struct ApiError(SchedulerError);

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            SchedulerError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            SchedulerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            SchedulerError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            SchedulerError::TriggerExhausted => (StatusCode::UNPROCESSABLE_ENTITY, "TRIGGER_EXHAUSTED"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let body = Json(json!({ "error": { "code": code, "message": self.0.to_string() } }));
        (status, body).into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:hash_id", get(get_task).put(update_task).delete(delete_task))
        .route("/tasks/:hash_id/trigger", post(trigger_task))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/log", get(get_job_log))
        .with_state(state)
}

async fn list_tasks(State(state): State<ApiState>) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.store.list_tasks().await?))
}

/// Malformed JSON (wrong type for `schedule_type`, a missing required
/// field) is a content problem, not a transport one, so it is parsed
/// through `serde_json::Value` and mapped to [`SchedulerError::Validation`]
/// (HTTP 422) rather than letting axum's `Json` extractor reject it as a
/// 400 before a handler ever runs.
fn parse_task_definition(value: serde_json::Value) -> Result<TaskDefinition, ApiError> {
    serde_json::from_value(value)
        .map_err(|e| ApiError(SchedulerError::validation(format!("Invalid task payload: {e}"))))
}

async fn create_task(
    State(state): State<ApiState>,
    Json(payload): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let definition = parse_task_definition(payload)?;
    let now = RealClock.now();
    let new_task: NewTask = definition.into();
    let task = Task::new(new_task, now)?;
    let saved = state.store.upsert_task(task).await?;
    state.scheduler.upsert_task(saved.clone()).await;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn get_task(
    State(state): State<ApiState>,
    Path(hash_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    state
        .store
        .get_task(&hash_id)
        .await?
        .map(Json)
        .ok_or_else(|| SchedulerError::not_found(format!("No task with hash_id {hash_id}")).into())
}

/// Only the fields that don't participate in `hash_id` can be changed
/// through an update — `hash_id` is immutable once assigned; a payload
/// that would move the content hash is rejected as a validation error
/// rather than silently minting a second task under the same path.
async fn update_task(
    State(state): State<ApiState>,
    Path(hash_id): Path<String>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<Task>, ApiError> {
    let existing = state
        .store
        .get_task(&hash_id)
        .await?
        .ok_or_else(|| SchedulerError::not_found(format!("No task with hash_id {hash_id}")))?;

    let definition = parse_task_definition(payload)?;
    let now = RealClock.now();
    let new_task: NewTask = definition.into();
    let mut updated = Task::new(new_task, existing.created_at)?;
    if updated.hash_id != hash_id {
        return Err(SchedulerError::validation(
            "Update would change the task's hash_id; create a new task instead",
        )
        .into());
    }
    updated.updated_at = now;
    let saved = state.store.upsert_task(updated).await?;
    state.scheduler.upsert_task(saved.clone()).await;
    Ok(Json(saved))
}

async fn delete_task(State(state): State<ApiState>, Path(hash_id): Path<String>) -> Result<StatusCode, ApiError> {
    state.store.delete_task(&hash_id).await?;
    state.scheduler.remove_task(hash_id).await;
    Ok(StatusCode::OK)
}

#[derive(Debug, Serialize)]
struct TriggerResponse {
    job_id: Uuid,
}

async fn trigger_task(
    State(state): State<ApiState>,
    Path(hash_id): Path<String>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let job_id = state.scheduler.trigger_now(hash_id).await?;
    Ok(Json(TriggerResponse { job_id }))
}

#[derive(Debug, Deserialize)]
struct JobListQuery {
    task_hash_id: Option<String>,
    status: Option<String>,
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let mut jobs = state.store.list_jobs(query.task_hash_id.as_deref()).await?;
    if let Some(status) = query.status {
        jobs.retain(|job| job.status.as_str().eq_ignore_ascii_case(&status));
    }
    Ok(Json(jobs))
}

async fn get_job(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Result<Json<Job>, ApiError> {
    state
        .store
        .get_job(id)
        .await?
        .map(Json)
        .ok_or_else(|| SchedulerError::not_found(format!("No job with id {id}")).into())
}

#[derive(Debug, Serialize)]
struct JobLogResponse {
    output: String,
}

async fn get_job_log(State(state): State<ApiState>, Path(id): Path<Uuid>) -> Result<Json<JobLogResponse>, ApiError> {
    let job = state
        .store
        .get_job(id)
        .await?
        .ok_or_else(|| SchedulerError::not_found(format!("No job with id {id}")))?;
    let output = match &job.output_log_path {
        Some(path) => tokio::fs::read_to_string(path).await.unwrap_or_default(),
        None => String::new(),
    };
    Ok(Json(JobLogResponse { output }))
}
