//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use postrelay_core::{ContentId, DeviceId, GroupId, JobId, RunId, TenantId};
use postrelay_publishing::{Job, JobStatus, NewJob, Run, RunClose};

use super::{JobFilter, JobStore, Materialized, OutcomeUpdate, QueueStats, StoreError};

/// In-memory job store.
///
/// Each operation takes the map lock exactly once, which models the
/// transactional atomicity of the persistent store. The transition
/// predicates are re-checked inside that critical section, same as the
/// SQL `WHERE` clauses in the Postgres implementation.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    runs: RwLock<HashMap<RunId, Run>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_update(job: &mut Job, update: &OutcomeUpdate, now: DateTime<Utc>) {
    job.status = update.next_status;
    if update.increment_attempts {
        job.attempt_count += 1;
    }
    if update.release_lock {
        job.locked_by = None;
        job.locked_at = None;
    }
    if update.error_code.is_some() {
        job.last_error_code = update.error_code.clone();
    }
    if update.error_message.is_some() {
        job.last_error_message = update.error_message.clone();
    }
    job.updated_at = now;
}

fn lock<T>(guard: Result<T, std::sync::PoisonError<T>>) -> Result<T, StoreError> {
    guard.map_err(|_| StoreError::Storage("job store lock poisoned".to_string()))
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn materialize(
        &self,
        draft: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Materialized, StoreError> {
        let mut jobs = lock(self.jobs.write())?;

        let existing = jobs
            .values()
            .find(|j| j.tenant_id == draft.tenant_id && j.idempotency_key == draft.idempotency_key)
            .map(|j| j.id);

        match existing {
            None => {
                let job = draft.into_job(JobId::new(), now);
                jobs.insert(job.id, job.clone());
                Ok(Materialized::Created(job))
            }
            Some(id) => {
                let job = jobs.get_mut(&id).expect("row exists under lock");
                if job.status == JobStatus::Queued {
                    job.scheduled_at = draft.scheduled_at;
                    job.updated_at = now;
                    Ok(Materialized::Rescheduled(job.clone()))
                } else {
                    Ok(Materialized::Skipped(job.clone()))
                }
            }
        }
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = lock(self.jobs.read())?;
        Ok(jobs
            .get(&job_id)
            .filter(|j| j.tenant_id == tenant_id)
            .cloned())
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = lock(self.jobs.read())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && filter.matches(j))
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.scheduled_at, *j.id.as_uuid()));
        result.truncate(filter.effective_limit());
        Ok(result)
    }

    async fn jobs_for_content(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = lock(self.jobs.read())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id && j.content_id == content_id)
            .cloned()
            .collect();
        result.sort_by_key(|j| *j.id.as_uuid());
        Ok(result)
    }

    async fn active_count_for_device(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<u32, StoreError> {
        let jobs = lock(self.jobs.read())?;
        let count = jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id && j.status.is_active() && j.locked_by == Some(device_id)
            })
            .count();
        Ok(count as u32)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, StoreError> {
        let jobs = lock(self.jobs.read())?;
        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|j| j.tenant_id == tenant_id) {
            stats.bump(job.status);
        }
        Ok(stats)
    }

    async fn claim_batch(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        group_id: Option<GroupId>,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = lock(self.jobs.write())?;

        let mut candidates: Vec<_> = jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && j.status == JobStatus::Queued
                    && j.scheduled_at <= now
                    && group_id.is_none_or(|g| j.group_id == g)
            })
            .map(|j| (j.priority, j.scheduled_at, j.id))
            .collect();
        candidates.sort_by_key(|(priority, scheduled_at, id)| (*priority, *scheduled_at, *id.as_uuid()));
        candidates.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            let job = jobs.get_mut(&id).expect("candidate exists under lock");
            // Same re-check as the SQL predicate; a no-op under this lock,
            // load-bearing in the persistent store.
            if job.status != JobStatus::Queued {
                continue;
            }
            job.status = JobStatus::Claimed;
            job.locked_by = Some(device_id);
            job.locked_at = Some(now);
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn begin_run(
        &self,
        job_id: JobId,
        device_id: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Option<(Job, Run)>, StoreError> {
        let mut jobs = lock(self.jobs.write())?;
        let mut runs = lock(self.runs.write())?;

        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Claimed || job.locked_by != Some(device_id) {
            return Ok(None);
        }

        job.status = JobStatus::Running;
        job.updated_at = now;

        let run = Run::open(job_id, device_id, now);
        runs.insert(run.id, run.clone());

        Ok(Some((job.clone(), run)))
    }

    async fn apply_outcome(
        &self,
        job_id: JobId,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = lock(self.jobs.write())?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running {
            return Ok(None);
        }
        apply_update(job, update, now);
        Ok(Some(job.clone()))
    }

    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = lock(self.jobs.write())?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.tenant_id != tenant_id || !job.status.can_transition_to(JobStatus::Cancelled) {
            return Ok(None);
        }
        job.status = JobStatus::Cancelled;
        job.locked_by = None;
        job.locked_at = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn cancel_all(
        &self,
        tenant_id: TenantId,
        group_id: Option<GroupId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = lock(self.jobs.write())?;
        let mut cancelled = Vec::new();
        for job in jobs.values_mut() {
            if job.tenant_id != tenant_id
                || !group_id.is_none_or(|g| job.group_id == g)
                || !job.status.can_transition_to(JobStatus::Cancelled)
            {
                continue;
            }
            job.status = JobStatus::Cancelled;
            job.locked_by = None;
            job.locked_at = None;
            job.updated_at = now;
            cancelled.push(job.clone());
        }
        Ok(cancelled)
    }

    async fn stale_claimed(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = lock(self.jobs.read())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Claimed && j.locked_at.is_some_and(|t| t < cutoff))
            .cloned()
            .collect();
        result.sort_by_key(|j| j.locked_at);
        Ok(result)
    }

    async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let jobs = lock(self.jobs.read())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.updated_at < cutoff)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.updated_at);
        Ok(result)
    }

    async fn expire_claimed(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = lock(self.jobs.write())?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Claimed || !job.locked_at.is_some_and(|t| t < cutoff) {
            return Ok(None);
        }
        apply_update(job, update, now);
        Ok(Some(job.clone()))
    }

    async fn expire_running(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = lock(self.jobs.write())?;
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Running || job.updated_at >= cutoff {
            return Ok(None);
        }
        apply_update(job, update, now);
        Ok(Some(job.clone()))
    }

    async fn open_run(&self, job_id: JobId) -> Result<Option<Run>, StoreError> {
        let runs = lock(self.runs.read())?;
        Ok(runs
            .values()
            .filter(|r| r.job_id == job_id && r.status.is_open())
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn close_run(
        &self,
        run_id: RunId,
        close: &RunClose,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>, StoreError> {
        let mut runs = lock(self.runs.write())?;
        let Some(run) = runs.get_mut(&run_id) else {
            return Ok(None);
        };
        if !run.status.is_open() {
            return Ok(None);
        }
        if let Some(status) = close.status {
            run.status = status;
        }
        run.finished_at = Some(now);
        if close.artifact_ref.is_some() {
            run.artifact_ref = close.artifact_ref.clone();
        }
        if close.published_url.is_some() {
            run.published_url = close.published_url.clone();
        }
        if close.failure_reason.is_some() {
            run.failure_reason = close.failure_reason.clone();
        }
        if close.logs.is_some() {
            run.logs = close.logs.clone();
        }
        Ok(Some(run.clone()))
    }

    async fn runs_for_job(&self, job_id: JobId) -> Result<Vec<Run>, StoreError> {
        let runs = lock(self.runs.read())?;
        let mut result: Vec<_> = runs
            .values()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect();
        result.sort_by_key(|r| (r.started_at, *r.id.as_uuid()));
        Ok(result)
    }
}
