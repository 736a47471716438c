//! Postgres-backed job store.
//!
//! Every transition is a single conditional `UPDATE … WHERE <expected
//! status / lock holder / staleness> RETURNING *`. A competing write that
//! commits first makes the statement affect zero rows, which surfaces to
//! callers as `Ok(None)` — the same contract as the in-memory store, but
//! enforced by the database, so it holds across any number of stateless
//! service replicas.
//!
//! Claiming selects candidates with `FOR UPDATE SKIP LOCKED` and re-checks
//! `status = 'queued'` in the update itself; two devices claiming
//! concurrently partition the due set instead of double-dispatching.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use tracing::instrument;
use uuid::Uuid;

use postrelay_core::{ContentId, DeviceId, GroupId, JobId, RunId, TenantId};
use postrelay_publishing::{Job, JobStatus, NewJob, Platform, Run, RunClose, RunStatus};

use super::{JobFilter, JobStore, Materialized, OutcomeUpdate, QueueStats, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS publish_jobs (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL,
    content_id UUID NOT NULL,
    group_id UUID NOT NULL,
    platform TEXT NOT NULL,
    status TEXT NOT NULL,
    scheduled_at TIMESTAMPTZ NOT NULL,
    priority INT NOT NULL DEFAULT 0,
    attempt_count INT NOT NULL DEFAULT 0,
    max_attempts INT NOT NULL,
    locked_by UUID,
    locked_at TIMESTAMPTZ,
    last_error_code TEXT,
    last_error_message TEXT,
    idempotency_key TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS publish_jobs_tenant_idem_key
    ON publish_jobs (tenant_id, idempotency_key);
CREATE INDEX IF NOT EXISTS publish_jobs_claim_order
    ON publish_jobs (tenant_id, status, priority, scheduled_at);
CREATE INDEX IF NOT EXISTS publish_jobs_staleness
    ON publish_jobs (status, locked_at);

CREATE TABLE IF NOT EXISTS publish_runs (
    id UUID PRIMARY KEY,
    job_id UUID NOT NULL REFERENCES publish_jobs (id),
    device_id UUID NOT NULL,
    status TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    artifact_ref TEXT,
    published_url TEXT,
    failure_reason TEXT,
    logs JSONB
);

CREATE INDEX IF NOT EXISTS publish_runs_job
    ON publish_runs (job_id, started_at);
"#;

const JOB_COLUMNS: &str = "id, tenant_id, content_id, group_id, platform, status, scheduled_at, \
     priority, attempt_count, max_attempts, locked_by, locked_at, \
     last_error_code, last_error_message, idempotency_key, created_at, updated_at";

const RUN_COLUMNS: &str = "id, job_id, device_id, status, started_at, finished_at, \
     artifact_ref, published_url, failure_reason, logs";

/// Postgres-backed job store.
///
/// Thread safety comes from the SQLx pool; the store itself is stateless.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    tenant_id: Uuid,
    content_id: Uuid,
    group_id: Uuid,
    platform: String,
    status: String,
    scheduled_at: DateTime<Utc>,
    priority: i32,
    attempt_count: i32,
    max_attempts: i32,
    locked_by: Option<Uuid>,
    locked_at: Option<DateTime<Utc>>,
    last_error_code: Option<String>,
    last_error_message: Option<String>,
    idempotency_key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status)
            .map_err(|e| StoreError::Storage(format!("corrupt job row {}: {e}", row.id)))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            content_id: ContentId::from_uuid(row.content_id),
            group_id: GroupId::from_uuid(row.group_id),
            platform: Platform::from(row.platform),
            status,
            scheduled_at: row.scheduled_at,
            priority: row.priority,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            locked_by: row.locked_by.map(DeviceId::from_uuid),
            locked_at: row.locked_at,
            last_error_code: row.last_error_code,
            last_error_message: row.last_error_message,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct RunRow {
    id: Uuid,
    job_id: Uuid,
    device_id: Uuid,
    status: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    artifact_ref: Option<String>,
    published_url: Option<String>,
    failure_reason: Option<String>,
    logs: Option<serde_json::Value>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = RunStatus::from_str(&row.status)
            .map_err(|e| StoreError::Storage(format!("corrupt run row {}: {e}", row.id)))?;
        Ok(Run {
            id: RunId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            device_id: DeviceId::from_uuid(row.device_id),
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            artifact_ref: row.artifact_ref,
            published_url: row.published_url,
            failure_reason: row.failure_reason,
            logs: row.logs,
        })
    }
}

fn map_sqlx_error(operation: &str, error: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("{operation}: {error}"))
}

fn jobs_from_rows(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the idempotent DDL. Called once at startup.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))
    }

    /// Shared shape of the guarded outcome/expiry writes. `extra_predicate`
    /// narrows the expected prior state; `$9` binds its time argument when
    /// present.
    async fn guarded_update(
        &self,
        operation: &'static str,
        job_id: JobId,
        expected_status: JobStatus,
        extra_predicate: &str,
        cutoff: Option<DateTime<Utc>>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            UPDATE publish_jobs
            SET status = $2,
                attempt_count = attempt_count + $3,
                locked_by = CASE WHEN $4 THEN NULL ELSE locked_by END,
                locked_at = CASE WHEN $4 THEN NULL ELSE locked_at END,
                last_error_code = COALESCE($5, last_error_code),
                last_error_message = COALESCE($6, last_error_message),
                updated_at = $7
            WHERE id = $1 AND status = $8 {extra_predicate}
            RETURNING {JOB_COLUMNS}
            "#
        );

        let mut query = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .bind(update.next_status.as_str())
            .bind(i32::from(update.increment_attempts))
            .bind(update.release_lock)
            .bind(update.error_code.as_deref())
            .bind(update.error_message.as_deref())
            .bind(now)
            .bind(expected_status.as_str());
        if let Some(cutoff) = cutoff {
            query = query.bind(cutoff);
        }

        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(Job::try_from).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, draft), fields(tenant_id = %draft.tenant_id), err)]
    async fn materialize(
        &self,
        draft: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Materialized, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("materialize", e))?;

        let insert_sql = format!(
            r#"
            INSERT INTO publish_jobs (
                id, tenant_id, content_id, group_id, platform, status,
                scheduled_at, priority, attempt_count, max_attempts,
                idempotency_key, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'queued', $6, $7, 0, $8, $9, $10, $10)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        );
        let new_id = JobId::new();
        let inserted = sqlx::query_as::<_, JobRow>(&insert_sql)
            .bind(new_id.as_uuid())
            .bind(draft.tenant_id.as_uuid())
            .bind(draft.content_id.as_uuid())
            .bind(draft.group_id.as_uuid())
            .bind(draft.platform.as_str())
            .bind(draft.scheduled_at)
            .bind(draft.priority)
            .bind(draft.max_attempts as i32)
            .bind(&draft.idempotency_key)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("materialize", e))?;

        if let Some(row) = inserted {
            tx.commit().await.map_err(|e| map_sqlx_error("materialize", e))?;
            return Ok(Materialized::Created(row.try_into()?));
        }

        // A row exists for this key; reschedule only while still QUEUED.
        let reschedule_sql = format!(
            r#"
            UPDATE publish_jobs
            SET scheduled_at = $3, updated_at = $4
            WHERE tenant_id = $1 AND idempotency_key = $2 AND status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rescheduled = sqlx::query_as::<_, JobRow>(&reschedule_sql)
            .bind(draft.tenant_id.as_uuid())
            .bind(&draft.idempotency_key)
            .bind(draft.scheduled_at)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("materialize", e))?;

        let outcome = match rescheduled {
            Some(row) => Materialized::Rescheduled(row.try_into()?),
            None => {
                let select_sql = format!(
                    "SELECT {JOB_COLUMNS} FROM publish_jobs \
                     WHERE tenant_id = $1 AND idempotency_key = $2"
                );
                let row = sqlx::query_as::<_, JobRow>(&select_sql)
                    .bind(draft.tenant_id.as_uuid())
                    .bind(&draft.idempotency_key)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("materialize", e))?;
                Materialized::Skipped(row.try_into()?)
            }
        };

        tx.commit().await.map_err(|e| map_sqlx_error("materialize", e))?;
        Ok(outcome)
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM publish_jobs WHERE id = $1 AND tenant_id = $2"
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(Job::try_from).transpose()
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        filter: &JobFilter,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM publish_jobs
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::uuid IS NULL OR group_id = $3)
              AND ($4::uuid IS NULL OR content_id = $4)
              AND ($5::timestamptz IS NULL OR scheduled_at >= $5)
              AND ($6::timestamptz IS NULL OR scheduled_at <= $6)
            ORDER BY scheduled_at ASC, id ASC
            LIMIT $7
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.group_id.map(|g| *g.as_uuid()))
            .bind(filter.content_id.map(|c| *c.as_uuid()))
            .bind(filter.scheduled_from)
            .bind(filter.scheduled_to)
            .bind(filter.effective_limit() as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        jobs_from_rows(rows)
    }

    async fn jobs_for_content(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM publish_jobs \
             WHERE tenant_id = $1 AND content_id = $2 ORDER BY id ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(content_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("jobs_for_content", e))?;
        jobs_from_rows(rows)
    }

    async fn active_count_for_device(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
    ) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM publish_jobs \
             WHERE tenant_id = $1 AND locked_by = $2 AND status IN ('claimed', 'running')",
        )
        .bind(tenant_id.as_uuid())
        .bind(device_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_count_for_device", e))?;
        Ok(count.max(0) as u32)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<QueueStats, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM publish_jobs WHERE tenant_id = $1 GROUP BY status",
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let status = JobStatus::from_str(&status)
                .map_err(|e| StoreError::Storage(format!("corrupt status bucket: {e}")))?;
            stats.add(status, count.max(0) as usize);
        }
        Ok(stats)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, device_id = %device_id), err)]
    async fn claim_batch(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        group_id: Option<GroupId>,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // Candidate selection and the claim itself are one statement; the
        // WHERE on the UPDATE re-checks status so a competing claimer's
        // commit turns the overlap into a no-op.
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT id AS candidate_id FROM publish_jobs
                WHERE tenant_id = $1
                  AND status = 'queued'
                  AND scheduled_at <= $3
                  AND ($4::uuid IS NULL OR group_id = $4)
                ORDER BY priority ASC, scheduled_at ASC
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            UPDATE publish_jobs
            SET status = 'claimed', locked_by = $2, locked_at = $3, updated_at = $3
            FROM candidates
            WHERE publish_jobs.id = candidates.candidate_id AND publish_jobs.status = 'queued'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(device_id.as_uuid())
            .bind(now)
            .bind(group_id.map(|g| *g.as_uuid()))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut jobs = jobs_from_rows(rows)?;
        jobs.sort_by_key(|j| (j.priority, j.scheduled_at, *j.id.as_uuid()));
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %job_id, device_id = %device_id), err)]
    async fn begin_run(
        &self,
        job_id: JobId,
        device_id: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Option<(Job, Run)>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_run", e))?;

        let update_sql = format!(
            r#"
            UPDATE publish_jobs
            SET status = 'running', updated_at = $3
            WHERE id = $1 AND status = 'claimed' AND locked_by = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&update_sql)
            .bind(job_id.as_uuid())
            .bind(device_id.as_uuid())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("begin_run", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("begin_run", e))?;
            return Ok(None);
        };
        let job: Job = row.try_into()?;

        let run = Run::open(job_id, device_id, now);
        sqlx::query(
            "INSERT INTO publish_runs (id, job_id, device_id, status, started_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(run.id.as_uuid())
        .bind(run.job_id.as_uuid())
        .bind(run.device_id.as_uuid())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("begin_run", e))?;

        tx.commit().await.map_err(|e| map_sqlx_error("begin_run", e))?;
        Ok(Some((job, run)))
    }

    async fn apply_outcome(
        &self,
        job_id: JobId,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.guarded_update("apply_outcome", job_id, JobStatus::Running, "", None, update, now)
            .await
    }

    async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            r#"
            UPDATE publish_jobs
            SET status = 'cancelled', locked_by = NULL, locked_at = NULL, updated_at = $3
            WHERE id = $1 AND tenant_id = $2
              AND status IN ('queued', 'claimed', 'running', 'needs_login')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job_id.as_uuid())
            .bind(tenant_id.as_uuid())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel", e))?;
        row.map(Job::try_from).transpose()
    }

    async fn cancel_all(
        &self,
        tenant_id: TenantId,
        group_id: Option<GroupId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            r#"
            UPDATE publish_jobs
            SET status = 'cancelled', locked_by = NULL, locked_at = NULL, updated_at = $3
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR group_id = $2)
              AND status IN ('queued', 'claimed', 'running', 'needs_login')
            RETURNING {JOB_COLUMNS}
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(tenant_id.as_uuid())
            .bind(group_id.map(|g| *g.as_uuid()))
            .bind(now)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("cancel_all", e))?;
        jobs_from_rows(rows)
    }

    async fn stale_claimed(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM publish_jobs \
             WHERE status = 'claimed' AND locked_at < $1 ORDER BY locked_at ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stale_claimed", e))?;
        jobs_from_rows(rows)
    }

    async fn stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM publish_jobs \
             WHERE status = 'running' AND updated_at < $1 ORDER BY updated_at ASC"
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stale_running", e))?;
        jobs_from_rows(rows)
    }

    async fn expire_claimed(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.guarded_update(
            "expire_claimed",
            job_id,
            JobStatus::Claimed,
            "AND locked_at < $9",
            Some(cutoff),
            update,
            now,
        )
        .await
    }

    async fn expire_running(
        &self,
        job_id: JobId,
        cutoff: DateTime<Utc>,
        update: &OutcomeUpdate,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, StoreError> {
        self.guarded_update(
            "expire_running",
            job_id,
            JobStatus::Running,
            "AND updated_at < $9",
            Some(cutoff),
            update,
            now,
        )
        .await
    }

    async fn open_run(&self, job_id: JobId) -> Result<Option<Run>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM publish_runs \
             WHERE job_id = $1 AND status = 'running' \
             ORDER BY started_at DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("open_run", e))?;
        row.map(Run::try_from).transpose()
    }

    async fn close_run(
        &self,
        run_id: RunId,
        close: &RunClose,
        now: DateTime<Utc>,
    ) -> Result<Option<Run>, StoreError> {
        let sql = format!(
            r#"
            UPDATE publish_runs
            SET status = COALESCE($2, status),
                finished_at = $3,
                artifact_ref = COALESCE($4, artifact_ref),
                published_url = COALESCE($5, published_url),
                failure_reason = COALESCE($6, failure_reason),
                logs = COALESCE($7, logs)
            WHERE id = $1 AND status = 'running'
            RETURNING {RUN_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id.as_uuid())
            .bind(close.status.map(|s| s.as_str()))
            .bind(now)
            .bind(close.artifact_ref.as_deref())
            .bind(close.published_url.as_deref())
            .bind(close.failure_reason.as_deref())
            .bind(close.logs.as_ref())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("close_run", e))?;
        row.map(Run::try_from).transpose()
    }

    async fn runs_for_job(&self, job_id: JobId) -> Result<Vec<Run>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM publish_runs \
             WHERE job_id = $1 ORDER BY started_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, RunRow>(&sql)
            .bind(job_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("runs_for_job", e))?;
        rows.into_iter().map(Run::try_from).collect()
    }
}
