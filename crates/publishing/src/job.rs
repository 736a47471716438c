//! Publish jobs and the job status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use postrelay_core::{ContentId, DeviceId, GroupId, JobId, TenantId};

/// Target-platform identifier (e.g. `"linkedin"`, `"x"`).
///
/// Kept open-ended on purpose: the set of supported platforms is owned by
/// the content collaborator, not by this queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Platform(String);

impl Platform {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Platform {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Platform {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Job execution status (closed set).
///
/// Every transition between statuses must appear in
/// [`JobStatus::can_transition_to`]; anything else is rejected at the
/// boundary.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed once its scheduled time is due.
    Queued,
    /// Leased to a device; the device has not started executing yet.
    Claimed,
    /// A device is executing a run for this job.
    Running,
    /// Published successfully. Terminal.
    Succeeded,
    /// Attempts exhausted. Terminal.
    Failed,
    /// The device hit a login wall on the target platform. The claiming
    /// device keeps the lock so no other device runs into the same wall;
    /// requires external resolution (or cancellation).
    NeedsLogin,
    /// Cancelled by the tenant. Terminal.
    Cancelled,
}

impl JobStatus {
    /// SUCCEEDED, FAILED, and CANCELLED never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Statuses that hold a device lock.
    pub fn holds_lock(&self) -> bool {
        matches!(
            self,
            JobStatus::Claimed | JobStatus::Running | JobStatus::NeedsLogin
        )
    }

    /// Statuses counted against a device's concurrent-active cap.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::NeedsLogin => "needs_login",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// The exhaustive transition table.
    ///
    /// CLAIMED and RUNNING can fall back to QUEUED (retry) or FAILED
    /// (attempts exhausted) through the recovery sweeper as well as through
    /// a reported failure; the decision is the same in both paths.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Queued, Claimed) => true,
            (Queued, Cancelled) => true,
            (Claimed, Running) => true,
            (Claimed, Queued) => true,
            (Claimed, Failed) => true,
            (Claimed, Cancelled) => true,
            (Running, Succeeded) => true,
            (Running, Failed) => true,
            (Running, NeedsLogin) => true,
            (Running, Queued) => true,
            (Running, Cancelled) => true,
            (Failed, Queued) => true,
            (NeedsLogin, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = postrelay_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "needs_login" => Ok(JobStatus::NeedsLogin),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(postrelay_core::DomainError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

/// Derive the idempotency key for one (content, platform, schedule) unit of
/// work. Re-issuing the same scheduling request always maps to the same key,
/// and the key is unique per tenant at the store level.
pub fn idempotency_key(
    content_id: ContentId,
    platform: &Platform,
    scheduled_at: DateTime<Utc>,
) -> String {
    format!("{}:{}:{}", content_id, platform, scheduled_at.timestamp())
}

/// One unit of publish work: one content item, one platform, one schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Tenant scope; every read and write is bounded by it.
    pub tenant_id: TenantId,
    /// The content record this job publishes.
    pub content_id: ContentId,
    /// Content group, used for device affinity.
    pub group_id: GroupId,
    pub platform: Platform,
    pub status: JobStatus,
    pub scheduled_at: DateTime<Utc>,
    /// Lower sorts sooner within the due set.
    pub priority: i32,
    /// Monotonically non-decreasing; never exceeds `max_attempts` while the
    /// job is non-terminal.
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// Lock holder; set iff the status holds a lock.
    pub locked_by: Option<DeviceId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    /// Unique per tenant; collapses repeated scheduling requests to one row.
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Attempts remain after `failed_attempts` failures.
    pub fn attempts_remaining_after(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }
}

/// Input for materializing one job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub content_id: ContentId,
    pub group_id: GroupId,
    pub platform: Platform,
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
    pub max_attempts: u32,
    pub idempotency_key: String,
}

impl NewJob {
    pub fn new(
        tenant_id: TenantId,
        content_id: ContentId,
        group_id: GroupId,
        platform: Platform,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Self {
        let idempotency_key = idempotency_key(content_id, &platform, scheduled_at);
        Self {
            tenant_id,
            content_id,
            group_id,
            platform,
            scheduled_at,
            priority: 0,
            max_attempts,
            idempotency_key,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Materialize the full row in QUEUED with attempt count 0.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            tenant_id: self.tenant_id,
            content_id: self.content_id,
            group_id: self.group_id,
            platform: self.platform,
            status: JobStatus::Queued,
            scheduled_at: self.scheduled_at,
            priority: self.priority,
            attempt_count: 0,
            max_attempts: self.max_attempts,
            locked_by: None,
            locked_at: None,
            last_error_code: None,
            last_error_message: None,
            idempotency_key: self.idempotency_key,
            created_at: now,
            updated_at: now,
        }
    }
}
