//! Request/response DTOs and mapping to/from domain types.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use postrelay_infra::dispatch::ClaimedJob;
use postrelay_infra::store::Materialized;
use postrelay_publishing::{Job, Run};

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub device_id: Uuid,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub device_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub device_id: Option<Uuid>,
    pub status: String,
    pub artifact_ref: Option<String>,
    pub published_url: Option<String>,
    pub logs: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateJobsRequest {
    pub content_id: Uuid,
    pub group_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub target_platforms: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelAllRequest {
    pub group_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub group_id: Option<Uuid>,
    pub content_id: Option<Uuid>,
    pub scheduled_from: Option<DateTime<Utc>>,
    pub scheduled_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

pub fn job_to_json(job: &Job) -> Value {
    json!({
        "id": job.id,
        "tenant_id": job.tenant_id,
        "content_id": job.content_id,
        "group_id": job.group_id,
        "platform": job.platform,
        "status": job.status,
        "scheduled_at": job.scheduled_at,
        "priority": job.priority,
        "attempt_count": job.attempt_count,
        "max_attempts": job.max_attempts,
        "locked_by": job.locked_by,
        "locked_at": job.locked_at,
        "last_error_code": job.last_error_code,
        "last_error_message": job.last_error_message,
        "created_at": job.created_at,
        "updated_at": job.updated_at,
    })
}

pub fn run_to_json(run: &Run) -> Value {
    json!({
        "id": run.id,
        "job_id": run.job_id,
        "device_id": run.device_id,
        "status": run.status,
        "started_at": run.started_at,
        "finished_at": run.finished_at,
        "artifact_ref": run.artifact_ref,
        "published_url": run.published_url,
        "failure_reason": run.failure_reason,
        "logs": run.logs,
    })
}

pub fn claimed_to_json(claimed: &ClaimedJob) -> Value {
    let mut value = job_to_json(&claimed.job);
    value["content_ref"] = json!(claimed.content_ref);
    value
}

pub fn materialized_to_json(materialized: &Materialized) -> Value {
    let (outcome, job) = match materialized {
        Materialized::Created(job) => ("created", job),
        Materialized::Rescheduled(job) => ("rescheduled", job),
        Materialized::Skipped(job) => ("skipped", job),
    };
    json!({
        "outcome": outcome,
        "job": job_to_json(job),
    })
}
