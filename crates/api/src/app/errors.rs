use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use postrelay_infra::dispatch::{CompletionOutcome, DispatchError};
use postrelay_publishing::JobStatus;

pub fn dispatch_error_to_response(err: DispatchError) -> axum::response::Response {
    match err {
        DispatchError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DispatchError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        DispatchError::InvalidState(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invalid_state", msg)
        }
        DispatchError::Validation(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        DispatchError::Store(e) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "store_error",
            e.to_string(),
        ),
        DispatchError::Directory(e) => {
            json_error(StatusCode::BAD_GATEWAY, "directory_error", e.to_string())
        }
        DispatchError::Content(e) => {
            json_error(StatusCode::BAD_GATEWAY, "content_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_outcome(s: &str) -> Result<CompletionOutcome, axum::response::Response> {
    match s.to_lowercase().as_str() {
        "succeeded" => Ok(CompletionOutcome::Succeeded),
        "failed" => Ok(CompletionOutcome::Failed),
        "needs_login" => Ok(CompletionOutcome::NeedsLogin),
        _ => Err(json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: succeeded, failed, needs_login",
        )),
    }
}

pub fn parse_status_filter(s: &str) -> Result<JobStatus, axum::response::Response> {
    s.to_lowercase().parse().map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "unknown job status filter",
        )
    })
}
