//! Atomic claim coordination.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use postrelay_core::{DeviceId, TenantId};
use postrelay_publishing::{Job, QueuePolicy};

use crate::content::ContentStore;
use crate::directory::DeviceDirectory;
use crate::store::JobStore;

use super::DispatchError;

/// A claimed job, enriched with what the device needs to execute it.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimedJob {
    #[serde(flatten)]
    pub job: Job,
    /// Where the device fetches the publishable payload.
    pub content_ref: Option<String>,
}

/// Lets a device atomically acquire a bounded batch of due, unclaimed
/// jobs. Mutual exclusion comes entirely from the store's conditional
/// claim update — there is no lock service in front of it.
pub struct ClaimCoordinator<S> {
    store: S,
    directory: Arc<dyn DeviceDirectory>,
    content: Arc<dyn ContentStore>,
    policy: QueuePolicy,
}

impl<S: JobStore> ClaimCoordinator<S> {
    pub fn new(
        store: S,
        directory: Arc<dyn DeviceDirectory>,
        content: Arc<dyn ContentStore>,
        policy: QueuePolicy,
    ) -> Self {
        Self {
            store,
            directory,
            content,
            policy,
        }
    }

    /// Claim up to `requested_limit` jobs for a device.
    ///
    /// An empty result is not an error — it means nothing was due, the
    /// device is at its active cap, or competing claimers got there first.
    pub async fn claim(
        &self,
        tenant_id: TenantId,
        device_id: DeviceId,
        requested_limit: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, DispatchError> {
        let device = self
            .directory
            .lookup(tenant_id, device_id)
            .await?
            .ok_or(DispatchError::NotFound)?;

        let active = self
            .store
            .active_count_for_device(tenant_id, device_id)
            .await?;
        let requested = requested_limit.unwrap_or(self.policy.claim_batch_cap);
        let limit = self.policy.effective_claim_limit(requested, active);
        if limit == 0 {
            debug!(device_id = %device_id, active, "device at active cap; claiming nothing");
            return Ok(Vec::new());
        }

        let jobs = self
            .store
            .claim_batch(tenant_id, device_id, device.affinity_group, limit, now)
            .await?;

        let mut claimed = Vec::with_capacity(jobs.len());
        for job in jobs {
            let content_ref = self.content.payload_ref(tenant_id, job.content_id).await?;
            claimed.push(ClaimedJob { job, content_ref });
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::InMemoryContentStore;
    use crate::directory::{DeviceRecord, InMemoryDeviceDirectory};
    use crate::store::InMemoryJobStore;
    use postrelay_core::{ContentId, GroupId};
    use postrelay_publishing::{JobStatus, NewJob, Platform};

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        directory: Arc<InMemoryDeviceDirectory>,
        coordinator: ClaimCoordinator<Arc<InMemoryJobStore>>,
        tenant: TenantId,
    }

    fn fixture(policy: QueuePolicy) -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let directory = Arc::new(InMemoryDeviceDirectory::new());
        let coordinator = ClaimCoordinator::new(
            store.clone(),
            directory.clone(),
            Arc::new(InMemoryContentStore::new()),
            policy,
        );
        Fixture {
            store,
            directory,
            coordinator,
            tenant: TenantId::new(),
        }
    }

    async fn seed_jobs(fixture: &Fixture, count: usize, now: DateTime<Utc>) {
        for _ in 0..count {
            let draft = NewJob::new(
                fixture.tenant,
                ContentId::new(),
                GroupId::new(),
                Platform::from("linkedin"),
                now,
                3,
            );
            fixture.store.materialize(draft, now).await.unwrap();
        }
    }

    fn device(fixture: &Fixture, affinity: Option<GroupId>) -> DeviceId {
        let device_id = DeviceId::new();
        fixture.directory.register(DeviceRecord {
            device_id,
            tenant_id: fixture.tenant,
            affinity_group: affinity,
        });
        device_id
    }

    #[tokio::test]
    async fn unknown_device_is_not_found() {
        let fixture = fixture(QueuePolicy::default());
        let err = fixture
            .coordinator
            .claim(fixture.tenant, DeviceId::new(), None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound));
    }

    #[tokio::test]
    async fn claim_is_bounded_by_the_per_call_cap() {
        let fixture = fixture(QueuePolicy::default().with_claim_batch_cap(2));
        let now = Utc::now();
        seed_jobs(&fixture, 5, now).await;
        let device_id = device(&fixture, None);

        let claimed = fixture
            .coordinator
            .claim(fixture.tenant, device_id, Some(10), now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|c| c.job.status == JobStatus::Claimed));
        assert!(claimed.iter().all(|c| c.content_ref.is_some()));
    }

    #[tokio::test]
    async fn claim_respects_the_device_active_cap() {
        let fixture = fixture(
            QueuePolicy::default()
                .with_claim_batch_cap(10)
                .with_device_active_cap(3),
        );
        let now = Utc::now();
        seed_jobs(&fixture, 6, now).await;
        let device_id = device(&fixture, None);

        let first = fixture
            .coordinator
            .claim(fixture.tenant, device_id, Some(2), now)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        // 2 already active, cap 3: one slot left regardless of the ask.
        let second = fixture
            .coordinator
            .claim(fixture.tenant, device_id, Some(10), now)
            .await
            .unwrap();
        assert_eq!(second.len(), 1);

        let third = fixture
            .coordinator
            .claim(fixture.tenant, device_id, Some(10), now)
            .await
            .unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn affinity_devices_only_see_their_group() {
        let fixture = fixture(QueuePolicy::default());
        let now = Utc::now();
        let group = GroupId::new();

        let in_group = NewJob::new(
            fixture.tenant,
            ContentId::new(),
            group,
            Platform::from("x"),
            now,
            3,
        );
        fixture.store.materialize(in_group, now).await.unwrap();
        seed_jobs(&fixture, 2, now).await;

        let device_id = device(&fixture, Some(group));
        let claimed = fixture
            .coordinator
            .claim(fixture.tenant, device_id, None, now)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.group_id, group);
    }

    #[tokio::test]
    async fn nothing_due_is_an_empty_result() {
        let fixture = fixture(QueuePolicy::default());
        let device_id = device(&fixture, None);

        let claimed = fixture
            .coordinator
            .claim(fixture.tenant, device_id, None, Utc::now())
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }
}
