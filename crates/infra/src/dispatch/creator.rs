//! Idempotent job materialization.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use postrelay_core::{ContentId, GroupId, TenantId};
use postrelay_publishing::{NewJob, Platform, QueuePolicy};

use crate::audit::{AuditEvent, AuditLog};
use crate::store::{JobStore, Materialized};

use super::DispatchError;

/// A scheduling request: one content item, one schedule, many platforms.
#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub tenant_id: TenantId,
    pub content_id: ContentId,
    pub group_id: GroupId,
    pub scheduled_at: DateTime<Utc>,
    pub target_platforms: Vec<Platform>,
}

/// Materializes one job per (content, platform, schedule).
///
/// Re-issuing the same request never creates duplicate rows: the
/// deterministic idempotency key collapses repeats onto the existing row,
/// and rescheduling only moves rows that are still QUEUED.
pub struct JobCreator<S> {
    store: S,
    audit: Arc<dyn AuditLog>,
    policy: QueuePolicy,
}

impl<S: JobStore> JobCreator<S> {
    pub fn new(store: S, audit: Arc<dyn AuditLog>, policy: QueuePolicy) -> Self {
        Self {
            store,
            audit,
            policy,
        }
    }

    pub async fn materialize(
        &self,
        request: MaterializeRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<Materialized>, DispatchError> {
        if request.target_platforms.is_empty() {
            return Err(DispatchError::Validation(
                "at least one target platform is required".to_string(),
            ));
        }

        let mut outcomes = Vec::with_capacity(request.target_platforms.len());
        for platform in &request.target_platforms {
            let draft = NewJob::new(
                request.tenant_id,
                request.content_id,
                request.group_id,
                platform.clone(),
                request.scheduled_at,
                self.policy.default_max_attempts,
            );
            let outcome = self.store.materialize(draft, now).await?;

            match &outcome {
                Materialized::Created(job) => {
                    self.audit.record(AuditEvent::JobMaterialized {
                        tenant_id: job.tenant_id,
                        job_id: job.id,
                        content_id: job.content_id,
                        platform: job.platform.clone(),
                        scheduled_at: job.scheduled_at,
                    });
                }
                Materialized::Rescheduled(job) => {
                    debug!(job_id = %job.id, scheduled_at = %job.scheduled_at, "job rescheduled");
                }
                Materialized::Skipped(job) => {
                    debug!(
                        job_id = %job.id,
                        status = %job.status,
                        "reschedule skipped; job is past QUEUED"
                    );
                }
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::store::InMemoryJobStore;
    use postrelay_core::DeviceId;
    use postrelay_publishing::JobStatus;
    use std::sync::Arc;

    fn creator(
        store: Arc<InMemoryJobStore>,
    ) -> (JobCreator<Arc<InMemoryJobStore>>, Arc<InMemoryAuditLog>) {
        let audit = Arc::new(InMemoryAuditLog::new());
        let creator = JobCreator::new(store, audit.clone(), QueuePolicy::default());
        (creator, audit)
    }

    fn request(platforms: &[&str]) -> MaterializeRequest {
        MaterializeRequest {
            tenant_id: TenantId::new(),
            content_id: ContentId::new(),
            group_id: GroupId::new(),
            scheduled_at: Utc::now(),
            target_platforms: platforms.iter().map(|p| Platform::from(*p)).collect(),
        }
    }

    #[tokio::test]
    async fn creates_one_job_per_platform() {
        let store = Arc::new(InMemoryJobStore::new());
        let (creator, audit) = creator(store.clone());
        let request = request(&["linkedin", "x", "facebook"]);
        let now = Utc::now();

        let outcomes = creator.materialize(request.clone(), now).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, Materialized::Created(j) if j.status == JobStatus::Queued)));
        assert_eq!(audit.events().len(), 3);
    }

    #[tokio::test]
    async fn repeated_requests_do_not_duplicate() {
        let store = Arc::new(InMemoryJobStore::new());
        let (creator, _) = creator(store.clone());
        let request = request(&["linkedin", "x"]);
        let now = Utc::now();

        let first = creator.materialize(request.clone(), now).await.unwrap();
        let second = creator.materialize(request.clone(), now).await.unwrap();

        assert!(second
            .iter()
            .all(|o| matches!(o, Materialized::Rescheduled(_))));
        let stats = store.stats(request.tenant_id).await.unwrap();
        assert_eq!(stats.queued, 2);
        assert_eq!(first[0].job().id, second[0].job().id);
    }

    #[tokio::test]
    async fn empty_platform_list_is_a_validation_error() {
        let store = Arc::new(InMemoryJobStore::new());
        let (creator, _) = creator(store);

        let err = creator
            .materialize(request(&[]), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn reschedule_leaves_claimed_jobs_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        let (creator, _) = creator(store.clone());
        let request = request(&["linkedin"]);
        let now = Utc::now();

        creator.materialize(request.clone(), now).await.unwrap();
        store
            .claim_batch(request.tenant_id, DeviceId::new(), None, 1, now)
            .await
            .unwrap();

        let outcomes = creator.materialize(request, now).await.unwrap();
        assert!(matches!(outcomes[0], Materialized::Skipped(_)));
        assert_eq!(outcomes[0].job().status, JobStatus::Claimed);
    }
}
