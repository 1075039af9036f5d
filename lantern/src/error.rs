//! Typed errors for the job layer and the HTTP boundary.
//!
//! Infrastructure traits return `anyhow::Result`; the types here classify
//! failures where the caller has to branch on them (retry or not, which
//! status code to answer with).

use axum::extract::rejection::{BytesRejection, FormRejection, PathRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::correlation;

/// Failure reported by a job handler.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Infrastructure hiccup; the job is retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Bad input. Retrying cannot help.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Bug or panic inside the handler.
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, JobError::Transient(_))
    }

    /// Stable name stored alongside the failure in the status store.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Transient(_) => "transient",
            JobError::Validation(_) => "validation",
            JobError::Unexpected(_) => "unexpected",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            JobError::Transient(m) | JobError::Validation(m) | JobError::Unexpected(m) => m,
        }
    }
}

/// Errors surfaced by the job dispatch boundary.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The id is well-formed but was never issued, or its record expired.
    #[error("task {0} not found")]
    NotFound(String),
    #[error("invalid task id {0:?}")]
    InvalidTaskId(String),
    #[error("invalid job: {0}")]
    InvalidJob(String),
    /// Broker or status store could not be reached.
    #[error("job backend unavailable: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Error returned from HTTP handlers. Every body carries the active request id.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
    /// An extractor refused the request; keeps the extractor's status code.
    #[error("{1}")]
    Rejected(StatusCode, String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Rejected(status, _) => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound(_) => ApiError::NotFound(err.to_string()),
            DispatchError::InvalidTaskId(_) | DispatchError::InvalidJob(_) => {
                ApiError::BadRequest(err.to_string())
            }
            DispatchError::Backend(source) => {
                tracing::warn!(error = %source, "job backend unavailable");
                ApiError::Unavailable("job backend unavailable".to_string())
            }
        }
    }
}

impl From<FormRejection> for ApiError {
    fn from(rejection: FormRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        ApiError::Rejected(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(source) => {
                tracing::error!(error = %format!("{source:#}"), "unhandled error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        error_response(status, message)
    }
}

/// `{error, request_id}` body used for every non-2xx answer.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let request_id = correlation::current().map(|ctx| ctx.request_id().to_string());
    let body = json!({
        "error": message.into(),
        "request_id": request_id,
    });
    (status, Json(body)).into_response()
}
