//! Job store abstraction.
//!
//! The store is the sole synchronization point of the queue. Every state
//! transition is expressed as a conditional update that re-checks the
//! expected prior status (and, where relevant, the lock holder or a
//! staleness cutoff) inside the write. A method returning `Ok(None)` means
//! the predicate no longer matched — some competing write committed first —
//! and the caller lost the race. Blind overwrites are not part of this
//! interface on purpose.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use postrelay_core::{ContentId, DeviceId, GroupId, JobId, RunId, TenantId};
use postrelay_publishing::{Job, JobStatus, NewJob, Run, RunClose};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of a materialization upsert.
#[derive(Debug, Clone)]
pub enum Materialized {
    /// No row existed for the idempotency key; a new QUEUED row was created.
    Created(Job),
    /// A QUEUED row existed; only its scheduled time was moved.
    Rescheduled(Job),
    /// A row existed but is past QUEUED; it was left untouched.
    Skipped(Job),
}

impl Materialized {
    pub fn job(&self) -> &Job {
        match self {
            Materialized::Created(job)
            | Materialized::Rescheduled(job)
            | Materialized::Skipped(job) => job,
        }
    }
}

/// Filter for tenant-facing job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub group_id: Option<GroupId>,
    pub content_id: Option<ContentId>,
    pub scheduled_from: Option<DateTime<Utc>>,
    pub scheduled_to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT)
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(group_id) = self.group_id {
            if job.group_id != group_id {
                return false;
            }
        }
        if let Some(content_id) = self.content_id {
            if job.content_id != content_id {
                return false;
            }
        }
        if let Some(from) = self.scheduled_from {
            if job.scheduled_at < from {
                return false;
            }
        }
        if let Some(to) = self.scheduled_to {
            if job.scheduled_at > to {
                return false;
            }
        }
        true
    }
}

/// Per-tenant queue statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub claimed: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub needs_login: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn add(&mut self, status: JobStatus, count: usize) {
        match status {
            JobStatus::Queued => self.queued += count,
            JobStatus::Claimed => self.claimed += count,
            JobStatus::Running => self.running += count,
            JobStatus::Succeeded => self.succeeded += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::NeedsLogin => self.needs_login += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn bump(&mut self, status: JobStatus) {
        self.add(status, 1);
    }
}

/// The RUNNING → outcome write, and the sweeper's expiry write.
///
/// One shape for both paths: a reported failure and a timed-out lease apply
/// the identical requeue-or-terminal-fail decision.
#[derive(Debug, Clone)]
pub struct OutcomeUpdate {
    pub next_status: JobStatus,
    /// Failure paths count the attempt; success does not re-count.
    pub increment_attempts: bool,
    /// NEEDS_LOGIN keeps the lock; everything else releases it.
    pub release_lock: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl OutcomeUpdate {
    pub fn succeeded() -> Self {
        Self {
            next_status: JobStatus::Succeeded,
            increment_attempts: false,
            release_lock: true,
            error_code: None,
            error_message: None,
        }
    }

    /// Attempts remain: back to QUEUED.
    pub fn retry(error_code: Option<String>, error_message: Option<String>) -> Self {
        Self {
            next_status: JobStatus::Queued,
            increment_attempts: true,
            release_lock: true,
            error_code,
            error_message,
        }
    }

    /// Attempts exhausted: terminal FAILED.
    pub fn terminal_failure(error_code: Option<String>, error_message: Option<String>) -> Self {
        Self {
            next_status: JobStatus::Failed,
            increment_attempts: true,
            release_lock: true,
            error_code,
            error_message,
        }
    }

    pub fn needs_login() -> Self {
        Self {
            next_status: JobStatus::NeedsLogin,
            increment_attempts: false,
            release_lock: false,
            error_code: None,
            error_message: None,
        }
    }
}

/// Durable job + run storage.
///
/// Transition methods return the post-image of the row, or `None` when the
/// guarding predicate did not match (the caller lost a race or targeted the
/// wrong state). Reads are always tenant-scoped; the sweeper's staleness
/// scans are the only cross-tenant queries.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Idempotent materialization: insert in QUEUED, or move the schedule
    /// of an existing QUEUED row, keyed by `(tenant_id, idempotency_key)`.
    async fn materialize(&self, draft: NewJob, now: DateTime<Utc>)
    -> Result<Materialized, StoreError>;

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, StoreError>;

    async fn list(&self, tenant_id: TenantId, filter: &JobFilter)
    -> Result<Vec<Job>, StoreError>;

    async fn jobs_for_content(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
    ) -> Result<Vec<Job>, StoreError>;

    /// CLAIMED + RUNNING count for the per-device concurrency cap. Always a
    /// store query, never an in-memory counter.
    async fn active_count_for_device(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<u32, StoreError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, StoreError>;

    /// Atomically claim up to `limit` due QUEUED jobs for a device, ordered
    /// by (priority asc, scheduled_at asc), optionally restricted to one
    /// content group. Jobs another claimer takes concurrently simply drop
    /// out of the result.
    async fn claim_batch(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        group_id: Option<GroupId>,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// CLAIMED → RUNNING, guarded by the lock holder; opens a run row in
    /// the same transaction.
    async fn begin_run(
        &self,
        job_id: JobId,
        device_id: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Option<(Job, Run)>, StoreError>;

    /// RUNNING → the outcome in `update`.
    async fn apply_outcome(
        &self,
        job_id: JobId,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Non-terminal → CANCELLED (per the transition table), clearing the
    /// lock.
    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Bulk-cancel every non-terminal job for a tenant, optionally scoped
    /// to a group. Returns the cancelled jobs.
    async fn cancel_all(
        &self,
        tenant_id: TenantId,
        group_id: Option<GroupId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// CLAIMED jobs whose lock was acquired before `cutoff`.
    async fn stale_claimed(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// RUNNING jobs not updated since `cutoff`.
    async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Sweeper write for an abandoned claim. The predicate re-checks both
    /// `status = CLAIMED` and the staleness condition, so a device that
    /// legitimately started at the boundary wins and this becomes a no-op.
    async fn expire_claimed(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// Sweeper write for an abandoned run; same discipline against a
    /// concurrent `complete`.
    async fn expire_running(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError>;

    /// The open (still RUNNING) run of a job, if any.
    async fn open_run(&self, job_id: JobId) -> Result<Option<Run>, StoreError>;

    /// Close an open run. `None` if the run was already closed.
    async fn close_run(
        &self,
        run_id: RunId,
        close: &RunClose,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>, StoreError>;

    async fn runs_for_job(&self, job_id: JobId) -> Result<Vec<Run>, StoreError>;
}

#[async_trait]
impl<S> JobStore for std::sync::Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn materialize(
        &self,
        draft: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Materialized, StoreError> {
        (**self).materialize(draft, now).await
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(tenant_id, job_id).await
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).list(tenant_id, filter).await
    }

    async fn jobs_for_content(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).jobs_for_content(tenant_id, content_id).await
    }

    async fn active_count_for_device(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<u32, StoreError> {
        (**self).active_count_for_device(tenant_id, device_id).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, StoreError> {
        (**self).stats(tenant_id).await
    }

    async fn claim_batch(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        group_id: Option<GroupId>,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        (**self)
            .claim_batch(tenant_id, device_id, group_id, limit, now)
            .await
    }

    async fn begin_run(
        &self,
        job_id: JobId,
        device_id: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Option<(Job, Run)>, StoreError> {
        (**self).begin_run(job_id, device_id, now).await
    }

    async fn apply_outcome(
        &self,
        job_id: JobId,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        (**self).apply_outcome(job_id, update, now).await
    }

    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        (**self).cancel(tenant_id, job_id, now).await
    }

    async fn cancel_all(
        &self,
        tenant_id: TenantId,
        group_id: Option<GroupId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).cancel_all(tenant_id, group_id, now).await
    }

    async fn stale_claimed(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        (**self).stale_claimed(cutoff).await
    }

    async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        (**self).stale_running(cutoff).await
    }

    async fn expire_claimed(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        (**self).expire_claimed(job_id, cutoff, update, now).await
    }

    async fn expire_running(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        (**self).expire_running(job_id, cutoff, update, now).await
    }

    async fn open_run(&self, job_id: JobId) -> Result<Option<Run>, StoreError> {
        (**self).open_run(job_id).await
    }

    async fn close_run(
        &self,
        run_id: RunId,
        close: &RunClose,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>, StoreError> {
        (**self).close_run(run_id, close, now).await
    }

    async fn runs_for_job(&self, job_id: JobId) -> Result<Vec<Run>, StoreError> {
        (**self).runs_for_job(job_id).await
    }
}
