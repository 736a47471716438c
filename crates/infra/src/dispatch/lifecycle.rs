//! Job lifecycle: start → outcome, retries, cancellation.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use postrelay_core::{ContentId, DeviceId, GroupId, JobId, TenantId};
use postrelay_events::{EventBus, OutcomeEvent};
use postrelay_publishing::{ContentStatus, Job, JobStatus, Run, RunClose};

use crate::audit::{AuditEvent, AuditLog};
use crate::content::ContentStore;
use crate::store::{JobStore, OutcomeUpdate};

use super::{recompute_content_status, DispatchError};

/// Outcome a device reports for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Succeeded,
    Failed,
    NeedsLogin,
}

/// A device's completion report.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub outcome: CompletionOutcome,
    pub artifact_ref: Option<String>,
    pub published_url: Option<String>,
    pub logs: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl CompletionRequest {
    pub fn new(outcome: CompletionOutcome) -> Self {
        Self {
            outcome,
            artifact_ref: None,
            published_url: None,
            logs: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn succeeded(artifact_ref: Option<String>, published_url: Option<String>) -> Self {
        Self {
            artifact_ref,
            published_url,
            ..Self::new(CompletionOutcome::Succeeded)
        }
    }

    pub fn failed(error_code: Option<String>, error_message: Option<String>) -> Self {
        Self {
            error_code,
            error_message,
            ..Self::new(CompletionOutcome::Failed)
        }
    }

    pub fn needs_login() -> Self {
        Self::new(CompletionOutcome::NeedsLogin)
    }

    pub fn with_logs(mut self, logs: Option<serde_json::Value>) -> Self {
        self.logs = logs;
        self
    }
}

/// Result of a completion call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub job: Job,
    /// True when the job was already terminal and the call changed nothing
    /// — the absorber for duplicate network retries and for completions
    /// arriving after a cancellation or sweep.
    pub idempotent: bool,
}

/// Advances claimed jobs through the state machine and applies the retry
/// policy. Outcome notifications are emitted as events strictly after the
/// store write commits; a failed publish is logged, never propagated.
pub struct LifecycleManager<S, B> {
    store: S,
    content: Arc<dyn ContentStore>,
    audit: Arc<dyn AuditLog>,
    bus: B,
}

impl<S, B> LifecycleManager<S, B>
where
    S: JobStore,
    B: EventBus<OutcomeEvent>,
{
    pub fn new(store: S, content: Arc<dyn ContentStore>, audit: Arc<dyn AuditLog>, bus: B) -> Self {
        Self {
            store,
            content,
            audit,
            bus,
        }
    }

    /// CLAIMED → RUNNING, by the lock-holding device only. Opens the run
    /// and marks the owning content record as publishing.
    pub async fn start(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        device_id: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<(Job, Run), DispatchError> {
        let snapshot = self
            .store
            .get(tenant_id, job_id)
            .await?
            .ok_or(DispatchError::NotFound)?;

        match self.store.begin_run(job_id, device_id, now).await? {
            Some((job, run)) => {
                info!(job_id = %job.id, device_id = %device_id, run_id = %run.id, "job started");
                if let Err(error) = self
                    .content
                    .set_status(tenant_id, job.content_id, ContentStatus::Publishing)
                    .await
                {
                    warn!(content_id = %job.content_id, error = %error, "failed to mark content publishing");
                }
                Ok((job, run))
            }
            None => {
                if snapshot.status != JobStatus::Claimed {
                    Err(DispatchError::InvalidState(format!(
                        "job is {}, not claimed",
                        snapshot.status
                    )))
                } else if snapshot.locked_by != Some(device_id) {
                    Err(DispatchError::Conflict(
                        "job is locked by another device".to_string(),
                    ))
                } else {
                    // The snapshot matched but the write lost a race.
                    Err(DispatchError::Conflict(
                        "job state changed concurrently".to_string(),
                    ))
                }
            }
        }
    }

    /// RUNNING → reported outcome. Idempotent on terminal jobs.
    pub async fn complete(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        request: CompletionRequest,
        now: DateTime<Utc>,
    ) -> Result<Completion, DispatchError> {
        let job = self
            .store
            .get(tenant_id, job_id)
            .await?
            .ok_or(DispatchError::NotFound)?;

        if job.status.is_terminal() {
            return Ok(Completion {
                job,
                idempotent: true,
            });
        }

        let outcome = request.outcome;

        if job.status != JobStatus::Running {
            return Err(DispatchError::InvalidState(format!(
                "job is {}, not running",
                job.status
            )));
        }
        let run = self
            .store
            .open_run(job_id)
            .await?
            .ok_or_else(|| DispatchError::InvalidState("job has no open run".to_string()))?;

        let update = match outcome {
            CompletionOutcome::Succeeded => OutcomeUpdate::succeeded(),
            CompletionOutcome::NeedsLogin => OutcomeUpdate::needs_login(),
            CompletionOutcome::Failed => {
                if job.attempts_remaining_after(job.attempt_count + 1) {
                    OutcomeUpdate::retry(request.error_code.clone(), request.error_message.clone())
                } else {
                    OutcomeUpdate::terminal_failure(
                        request.error_code.clone(),
                        request.error_message.clone(),
                    )
                }
            }
        };

        let Some(updated) = self.store.apply_outcome(job_id, &update, now).await? else {
            // Lost the race: a sweep, cancellation, or duplicate call
            // committed first. Absorb if that left the job terminal.
            let job = self
                .store
                .get(tenant_id, job_id)
                .await?
                .ok_or(DispatchError::NotFound)?;
            if job.status.is_terminal() {
                return Ok(Completion {
                    job,
                    idempotent: true,
                });
            }
            return Err(DispatchError::InvalidState(format!(
                "job is {}, not running",
                job.status
            )));
        };

        let close = match outcome {
            CompletionOutcome::Succeeded => RunClose::succeeded(
                request.artifact_ref.clone(),
                request.published_url.clone(),
            ),
            CompletionOutcome::Failed => RunClose::failed(
                request
                    .error_message
                    .clone()
                    .or_else(|| request.error_code.clone())
                    .unwrap_or_else(|| "publish failed".to_string()),
            ),
            CompletionOutcome::NeedsLogin => RunClose::needs_login(),
        };
        self.store
            .close_run(run.id, &close.with_logs(request.logs.clone()), now)
            .await?;

        info!(
            job_id = %updated.id,
            status = %updated.status,
            attempt_count = updated.attempt_count,
            "job outcome applied"
        );

        if updated.status.is_terminal() {
            self.notify(&updated);
            recompute_content_status(&self.store, &*self.content, tenant_id, updated.content_id)
                .await;
        }

        Ok(Completion {
            job: updated,
            idempotent: false,
        })
    }

    /// Explicit cancellation. Allowed from QUEUED, CLAIMED, RUNNING, and
    /// NEEDS_LOGIN; cooperative for running jobs — the device is not
    /// interrupted, its eventual completion call is absorbed as a
    /// terminal-state no-op.
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Job, DispatchError> {
        let job = self
            .store
            .get(tenant_id, job_id)
            .await?
            .ok_or(DispatchError::NotFound)?;

        if !job.status.can_transition_to(JobStatus::Cancelled) {
            return Err(DispatchError::InvalidState(format!(
                "cannot cancel a {} job",
                job.status
            )));
        }

        let Some(cancelled) = self.store.cancel(tenant_id, job_id, now).await? else {
            return Err(DispatchError::InvalidState(
                "job state changed concurrently".to_string(),
            ));
        };

        self.close_open_run(job_id, "cancelled", now).await;
        self.audit.record(AuditEvent::JobCancelled {
            tenant_id,
            job_id,
            previous_status: job.status,
        });
        recompute_content_status(&self.store, &*self.content, tenant_id, cancelled.content_id)
            .await;

        Ok(cancelled)
    }

    /// Bulk-cancel every non-terminal job for a tenant, optionally scoped
    /// to one content group.
    pub async fn cancel_all(
        &self,
        tenant_id: TenantId,
        group_id: Option<GroupId>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, DispatchError> {
        let cancelled = self.store.cancel_all(tenant_id, group_id, now).await?;

        let mut touched = BTreeSet::new();
        for job in &cancelled {
            self.close_open_run(job.id, "cancelled", now).await;
            self.audit.record(AuditEvent::JobCancelled {
                tenant_id,
                job_id: job.id,
                // cancel_all reports the post-image; the pre-image status
                // is not individually interesting for bulk cancellation.
                previous_status: job.status,
            });
            touched.insert(*job.content_id.as_uuid());
        }

        for content_uuid in touched {
            recompute_content_status(
                &self.store,
                &*self.content,
                tenant_id,
                ContentId::from_uuid(content_uuid),
            )
            .await;
        }

        Ok(cancelled)
    }

    async fn close_open_run(&self, job_id: JobId, reason: &str, now: DateTime<Utc>) {
        match self.store.open_run(job_id).await {
            Ok(Some(run)) => {
                if let Err(error) = self
                    .store
                    .close_run(run.id, &RunClose::failed(reason), now)
                    .await
                {
                    warn!(job_id = %job_id, error = %error, "failed to close open run");
                }
            }
            Ok(None) => {}
            Err(error) => {
                warn!(job_id = %job_id, error = %error, "failed to look up open run");
            }
        }
    }

    fn notify(&self, job: &Job) {
        let event = OutcomeEvent {
            tenant_id: job.tenant_id,
            job_id: job.id,
            content_id: job.content_id,
            platform: job.platform.clone(),
            status: job.status,
            error_message: job.last_error_message.clone(),
            occurred_at: job.updated_at,
        };
        if let Err(error) = self.bus.publish(event) {
            warn!(job_id = %job.id, error = ?error, "failed to publish outcome event");
        }
    }
}
