//! Tenant-facing routes: scheduling, listing, cancellation.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;

use postrelay_core::{ContentId, GroupId, JobId};
use postrelay_infra::dispatch::MaterializeRequest;
use postrelay_infra::store::JobFilter;
use postrelay_publishing::Platform;

use crate::app::{dto, errors, AppServices};
use crate::context::TenantContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list).post(create))
        .route("/stats", get(stats))
        .route("/cancel", post(cancel_all))
        .route("/:id", get(fetch))
        .route("/:id/cancel", post(cancel))
}

pub async fn create(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::CreateJobsRequest>,
) -> axum::response::Response {
    let request = MaterializeRequest {
        tenant_id: tenant.tenant_id(),
        content_id: ContentId::from_uuid(body.content_id),
        group_id: GroupId::from_uuid(body.group_id),
        scheduled_at: body.scheduled_at,
        target_platforms: body
            .target_platforms
            .iter()
            .map(|p| Platform::from(p.as_str()))
            .collect(),
    };

    let outcomes = match services.creator.materialize(request, Utc::now()).await {
        Ok(outcomes) => outcomes,
        Err(e) => return errors::dispatch_error_to_response(e),
    };

    (
        StatusCode::CREATED,
        Json(serde_json::json!({
            "jobs": outcomes.iter().map(dto::materialized_to_json).collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

pub async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(errors::parse_status_filter) {
        Some(Ok(status)) => Some(status),
        Some(Err(response)) => return response,
        None => None,
    };

    let filter = JobFilter {
        status,
        group_id: query.group_id.map(GroupId::from_uuid),
        content_id: query.content_id.map(ContentId::from_uuid),
        scheduled_from: query.scheduled_from,
        scheduled_to: query.scheduled_to,
        limit: query.limit,
    };

    let jobs = match services.store.list(tenant.tenant_id(), &filter).await {
        Ok(jobs) => jobs,
        Err(e) => return errors::dispatch_error_to_response(e.into()),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "jobs": jobs.iter().map(dto::job_to_json).collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    match services.store.stats(tenant.tenant_id()).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::dispatch_error_to_response(e.into()),
    }
}

pub async fn fetch(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    let job = match services.store.get(tenant.tenant_id(), job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        Err(e) => return errors::dispatch_error_to_response(e.into()),
    };
    let runs = match services.store.runs_for_job(job_id).await {
        Ok(runs) => runs,
        Err(e) => return errors::dispatch_error_to_response(e.into()),
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "job": dto::job_to_json(&job),
            "runs": runs.iter().map(dto::run_to_json).collect::<Vec<_>>(),
        })),
    )
        .into_response()
}

pub async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services
        .lifecycle
        .cancel(tenant.tenant_id(), job_id, Utc::now())
        .await
    {
        Ok(job) => (StatusCode::OK, Json(dto::job_to_json(&job))).into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}

pub async fn cancel_all(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    body: Option<Json<dto::CancelAllRequest>>,
) -> axum::response::Response {
    let group_id = body
        .map(|Json(b)| b.group_id)
        .unwrap_or_default()
        .map(GroupId::from_uuid);

    match services
        .lifecycle
        .cancel_all(tenant.tenant_id(), group_id, Utc::now())
        .await
    {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(serde_json::json!({ "cancelled": cancelled.len() })),
        )
            .into_response(),
        Err(e) => errors::dispatch_error_to_response(e),
    }
}
