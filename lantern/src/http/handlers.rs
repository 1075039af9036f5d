use std::io::ErrorKind;

use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FormRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::{Form, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::dispatch::JobStatus;
use crate::error::{error_response, ApiError};
use crate::export::{export_path, ExportJob, ExportRequest};
use crate::metrics::TEXT_CONTENT_TYPE;
use crate::todo::{Todo, MAX_TEXT_LEN};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct AddTodoForm {
    #[serde(default)]
    pub task: String,
}

/// Liveness. Touches nothing.
pub async fn healthz() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Broker connectivity check.
pub async fn healthz_background(State(state): State<AppState>) -> Response {
    match state.dispatcher.broker().ping().await {
        Ok(()) => Json(json!({ "broker": "ok" })).into_response(),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "Broker health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "broker": "unreachable",
                    "error": "broker did not answer",
                })),
            )
                .into_response()
        }
    }
}

pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state.telemetry.metrics().render()?;
    Ok(([(CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response())
}

pub async fn list_todos(State(state): State<AppState>) -> Result<Json<Vec<Todo>>, ApiError> {
    let todos = state.todos.list().await?;
    tracing::debug!(count = todos.len(), "Listed todos");
    Ok(Json(todos))
}

pub async fn add_todo(
    State(state): State<AppState>,
    form: Result<Form<AddTodoForm>, FormRejection>,
) -> Result<Redirect, ApiError> {
    let Form(form) = form?;
    let text = form.task.trim();
    if text.is_empty() {
        tracing::warn!("Ignoring empty task submission");
        return Ok(Redirect::to("/"));
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(ApiError::BadRequest(format!(
            "task text exceeds {MAX_TEXT_LEN} characters"
        )));
    }

    let todo = state.todos.add(text).await?;
    tracing::info!(todo_id = todo.id, "Added todo");
    Ok(Redirect::to("/"))
}

pub async fn delete_todo(
    State(state): State<AppState>,
    raw_index: Result<Path<String>, PathRejection>,
) -> Result<Redirect, ApiError> {
    let Path(raw_index) = raw_index?;
    let index: usize = raw_index
        .parse()
        .map_err(|_| ApiError::BadRequest("index must be a non-negative integer".into()))?;

    match state.todos.delete_at(index).await? {
        Some(todo) => tracing::info!(todo_id = todo.id, index, "Deleted todo"),
        None => tracing::warn!(index, "Delete requested for missing todo index"),
    }
    Ok(Redirect::to("/"))
}

/// Enqueue a CSV export. Answers before the job runs.
pub async fn start_export(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let body = body?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        ExportRequest::default()
    } else {
        serde_json::from_slice::<ExportRequest>(&body).map_err(|e| {
            tracing::warn!(error = %e, "Rejected export request");
            ApiError::BadRequest("invalid export request body".into())
        })?
    };

    // The count reflects the rows present now, not when a worker gets to it.
    let job = ExportJob::as_of(request.filters, state.todos.latest_id().await?);
    let task_id = state.dispatcher.submit(&job).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": task_id }))))
}

pub async fn task_status(
    State(state): State<AppState>,
    task_id: Result<Path<String>, PathRejection>,
) -> Result<Json<JobStatus>, ApiError> {
    let Path(task_id) = task_id?;
    let status = state.dispatcher.get_status(&task_id).await?;
    Ok(Json(status))
}

pub async fn download_export(
    State(state): State<AppState>,
    task_id: Result<Path<String>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(task_id) = task_id?;
    let status = state.dispatcher.get_status(&task_id).await?;
    if status.successful != Some(true) {
        return Err(ApiError::NotFound(format!(
            "export {} is not available",
            status.task_id
        )));
    }

    // The file name is derived from the task id, never from the stored result.
    let path = export_path(&state.export_dir, status.task_id);
    let contents = match tokio::fs::read(&path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            tracing::warn!(task_id = %status.task_id, "Export file missing on disk");
            return Err(ApiError::NotFound(format!(
                "export {} is not available",
                status.task_id
            )));
        }
        Err(err) => return Err(ApiError::Internal(err.into())),
    };

    let disposition = format!("attachment; filename=\"todos_export_{}.csv\"", status.task_id);
    Ok((
        [
            (CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        contents,
    )
        .into_response())
}

pub async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}
