//! Device-facing routes: claim, start, complete.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::Utc;

use postrelay_core::{DeviceId, JobId};
use postrelay_infra::dispatch::CompletionRequest;

use crate::app::{dto, errors, AppServices};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/claims", post(claim))
        .route("/jobs/:id/start", post(start))
        .route("/jobs/:id/complete", post(complete))
}

pub async fn claim(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::ClaimRequest>,
) -> axum::response::Response {
    let device_id = DeviceId::from_uuid(body.device_id);

    let claimed = match services
        .coordinator
        .claim(tenant.tenant_id(), device_id, body.limit, Utc::now())
        .await
    {
        Ok(claimed) => claimed,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "jobs": claimed.iter().map(dto::claimed_to_json).collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

pub async fn start(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::StartRequest>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };
    let device_id = DeviceId::from_uuid(body.device_id);

    let (job, run) = match services
        .lifecycle
        .start(tenant.tenant_id(), job_id, device_id, Utc::now())
        .await
    {
        Ok(started) => started,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "job_id": job.id,
            "run_id": run.id,
        })),
    )
        .into_response()
}

pub async fn complete(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
    Json(body): Json<dto::CompleteRequest>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };
    let outcome = match errors::parse_outcome(&body.status) {
        Ok(outcome) => outcome,
        Err(response) => return response,
    };

    let request = CompletionRequest {
        outcome,
        artifact_ref: body.artifact_ref,
        published_url: body.published_url,
        logs: body.logs,
        error_code: body.error_code,
        error_message: body.error_message,
    };

    let completion = match services
        .lifecycle
        .complete(tenant.tenant_id(), job_id, request, Utc::now())
        .await
    {
        Ok(completion) => completion,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "success": true,
            "idempotent": completion.idempotent,
            "job": dto::job_to_json(&completion.job),
        })),
    )
        .into_response()
}
