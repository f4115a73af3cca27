//! The read-only web UI: a thin renderer over the same Store the HTTP API
//! reads, one server-rendered HTML page per view, no client-side framework
//! and no write paths.

use crate::job::Job;
use crate::store::Store;
use crate::task::Task;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct WebState {
    pub store: Arc<dyn Store>,
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(task_list))
        .route("/tasks", get(task_list))
        .route("/tasks/:hash_id", get(task_detail))
        .route("/tasks/:hash_id/jobs/:id", get(job_detail))
        .route("/tasks/:hash_id/jobs/:id/log", get(job_log))
        .with_state(state)
}

fn escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn page(title: &str, body: String) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>{}</title></head>\
         <body><h1>{}</h1>{}</body></html>",
        escape(title),
        escape(title),
        body
    ))
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, page("Not found", format!("<p>{}</p>", escape(message)))).into_response()
}

async fn task_list(State(state): State<WebState>) -> Response {
    let tasks = match state.store.list_tasks().await {
        Ok(tasks) => tasks,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let mut rows = String::new();
    for task in &tasks {
        rows.push_str(&format!(
            "<tr><td><a href=\"/tasks/{hash}\">{name}</a></td><td>{schedule:?}</td><td>{status}</td></tr>",
            hash = escape(&task.hash_id),
            name = escape(&task.name),
            schedule = task.schedule_type,
            status = if task.enabled { "active" } else { "inactive" },
        ));
    }
    page(
        "Tasks",
        format!(
            "<table><thead><tr><th>Name</th><th>Schedule</th><th>Status</th></tr></thead><tbody>{rows}</tbody></table>"
        ),
    )
    .into_response()
}

async fn task_detail(State(state): State<WebState>, Path(hash_id): Path<String>) -> Response {
    let task = match state.store.get_task(&hash_id).await {
        Ok(Some(task)) => task,
        Ok(None) => return not_found(&format!("No task with hash_id {hash_id}")),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let jobs = match state.store.list_jobs(Some(&hash_id)).await {
        Ok(jobs) => jobs,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let mut rows = String::new();
    for job in &jobs {
        rows.push_str(&format!(
            "<tr><td><a href=\"/tasks/{hash}/jobs/{id}\">{id}</a></td><td>{status:?}</td>\
             <td>{trigger}</td><td>{retry}</td></tr>",
            hash = escape(&hash_id),
            id = job.id,
            status = job.status,
            trigger = job.trigger_time,
            retry = job.retry_count,
        ));
    }

    page(
        &task.name,
        format!(
            "<dl><dt>Hash id</dt><dd>{hash}</dd><dt>Target</dt><dd>{target}</dd>\
             <dt>Schedule</dt><dd>{schedule:?}</dd><dt>Status</dt><dd>{status}</dd></dl>\
             <h2>Jobs</h2><table><thead><tr><th>Id</th><th>Status</th><th>Trigger time</th><th>Retry</th></tr></thead>\
             <tbody>{rows}</tbody></table>",
            hash = escape(&task.hash_id),
            target = escape(task.target.label()),
            schedule = task.schedule_type,
            status = if task.enabled { "active" } else { "inactive" },
        ),
    )
    .into_response()
}

async fn job_detail(State(state): State<WebState>, Path((hash_id, id)): Path<(String, Uuid)>) -> Response {
    let job = match fetch_job_for_task(&state, &hash_id, id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found(&format!("No job {id} for task {hash_id}")),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    page(
        &format!("Job {id}"),
        format!(
            "<dl><dt>Status</dt><dd>{status:?}</dd><dt>Trigger time</dt><dd>{trigger}</dd>\
             <dt>Start time</dt><dd>{start:?}</dd><dt>End time</dt><dd>{end:?}</dd>\
             <dt>Exit code</dt><dd>{exit:?}</dd><dt>Error</dt><dd>{error}</dd>\
             <dt>Retry count</dt><dd>{retry}</dd></dl>\
             <p><a href=\"/tasks/{hash}/jobs/{id}/log\">View log</a></p>",
            status = job.status,
            trigger = job.trigger_time,
            start = job.start_time,
            end = job.end_time,
            exit = job.exit_code,
            error = job.error_message.as_deref().map(escape).unwrap_or_default(),
            retry = job.retry_count,
            hash = escape(&hash_id),
        ),
    )
    .into_response()
}

async fn job_log(State(state): State<WebState>, Path((hash_id, id)): Path<(String, Uuid)>) -> Response {
    let job = match fetch_job_for_task(&state, &hash_id, id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found(&format!("No job {id} for task {hash_id}")),
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    let output = match &job.output_log_path {
        Some(path) => tokio::fs::read_to_string(path).await.unwrap_or_default(),
        None => String::new(),
    };

    page(&format!("Job {id} log"), format!("<pre>{}</pre>", escape(&output))).into_response()
}

async fn fetch_job_for_task(state: &WebState, hash_id: &str, id: Uuid) -> crate::error::Result<Option<Job>> {
    Ok(state.store.get_job(id).await?.filter(|job| job.task_hash_id == hash_id))
}
