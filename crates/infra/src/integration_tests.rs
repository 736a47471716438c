//! End-to-end tests over the fully wired dispatch services.
//!
//! Everything runs against the in-memory store; the protocol logic under
//! test (conditional claims, retry bounds, sweeper recovery, status
//! aggregation) is identical for the Postgres store, which implements the
//! same guarded-update contract.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Barrier;

use postrelay_core::{ContentId, DeviceId, GroupId, TenantId};
use postrelay_events::{EventBus, InMemoryEventBus, OutcomeEvent};
use postrelay_publishing::{ContentStatus, JobStatus, Platform, QueuePolicy};

use crate::audit::InMemoryAuditLog;
use crate::content::{ContentStore, InMemoryContentStore};
use crate::directory::{DeviceRecord, InMemoryDeviceDirectory};
use crate::dispatch::{
    ClaimCoordinator, CompletionRequest, JobCreator, LifecycleManager, MaterializeRequest,
    RecoverySweeper, SweeperConfig,
};
use crate::store::{InMemoryJobStore, JobStore};

type Store = Arc<InMemoryJobStore>;
type Bus = Arc<InMemoryEventBus<OutcomeEvent>>;

struct Harness {
    store: Store,
    content: Arc<InMemoryContentStore>,
    directory: Arc<InMemoryDeviceDirectory>,
    bus: Bus,
    creator: JobCreator<Store>,
    coordinator: Arc<ClaimCoordinator<Store>>,
    lifecycle: LifecycleManager<Store, Bus>,
    sweeper: RecoverySweeper<Store, Bus>,
    tenant: TenantId,
}

fn harness() -> Harness {
    let store: Store = Arc::new(InMemoryJobStore::new());
    let content = Arc::new(InMemoryContentStore::new());
    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let audit = Arc::new(InMemoryAuditLog::new());
    let bus: Bus = Arc::new(InMemoryEventBus::new());
    let policy = QueuePolicy::default();

    Harness {
        store: store.clone(),
        content: content.clone(),
        directory: directory.clone(),
        bus: bus.clone(),
        creator: JobCreator::new(store.clone(), audit.clone(), policy),
        coordinator: Arc::new(ClaimCoordinator::new(
            store.clone(),
            directory.clone(),
            content.clone(),
            policy,
        )),
        lifecycle: LifecycleManager::new(store.clone(), content.clone(), audit.clone(), bus.clone()),
        sweeper: RecoverySweeper::new(
            store,
            content,
            audit,
            bus,
            SweeperConfig::default(),
        ),
        tenant: TenantId::new(),
    }
}

impl Harness {
    fn device(&self) -> DeviceId {
        let device_id = DeviceId::new();
        self.directory.register(DeviceRecord {
            device_id,
            tenant_id: self.tenant,
            affinity_group: None,
        });
        device_id
    }

    async fn schedule(
        &self,
        content_id: ContentId,
        platforms: &[&str],
        at: DateTime<Utc>,
    ) -> Vec<postrelay_core::JobId> {
        let request = MaterializeRequest {
            tenant_id: self.tenant,
            content_id,
            group_id: GroupId::new(),
            scheduled_at: at,
            target_platforms: platforms.iter().map(|p| Platform::from(*p)).collect(),
        };
        self.creator
            .materialize(request, at)
            .await
            .unwrap()
            .iter()
            .map(|m| m.job().id)
            .collect()
    }

    /// Claim, start, and complete one specific job on a fresh device.
    async fn run_to_outcome(
        &self,
        job_id: postrelay_core::JobId,
        request: CompletionRequest,
        now: DateTime<Utc>,
    ) -> JobStatus {
        let device = self.device();
        let claimed = self
            .coordinator
            .claim(self.tenant, device, Some(10), now)
            .await
            .unwrap();
        assert!(
            claimed.iter().any(|c| c.job.id == job_id),
            "job was not claimable"
        );
        self.lifecycle
            .start(self.tenant, job_id, device, now)
            .await
            .unwrap();
        self.lifecycle
            .complete(self.tenant, job_id, request, now)
            .await
            .unwrap()
            .job
            .status
    }
}

#[tokio::test]
async fn concurrent_claims_hand_each_job_to_exactly_one_device() {
    let harness = Arc::new(harness());
    let now = Utc::now();
    harness.schedule(ContentId::new(), &["linkedin"], now).await;

    const DEVICES: usize = 8;
    let barrier = Arc::new(Barrier::new(DEVICES));
    let mut tasks = Vec::new();
    for _ in 0..DEVICES {
        let harness = harness.clone();
        let barrier = barrier.clone();
        let device = harness.device();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            harness
                .coordinator
                .claim(harness.tenant, device, Some(1), now)
                .await
                .unwrap()
                .len()
        }));
    }

    let mut total = 0;
    for task in tasks {
        total += task.await.unwrap();
    }
    // N competing devices, one QUEUED job: exactly one winner, the rest
    // see it absent from their result set.
    assert_eq!(total, 1);
}

#[tokio::test]
async fn rematerializing_the_same_schedule_yields_one_row() {
    let harness = harness();
    let now = Utc::now();
    let content_id = ContentId::new();

    let first = harness.schedule(content_id, &["linkedin", "x"], now).await;
    let second = harness.schedule(content_id, &["linkedin", "x"], now).await;
    assert_eq!(first, second);

    let stats = harness.store.stats(harness.tenant).await.unwrap();
    assert_eq!(stats.queued, 2);
}

#[tokio::test]
async fn a_job_that_exhausts_attempts_is_never_claimable_again() {
    let harness = harness();
    let now = Utc::now();
    let [job_id]: [postrelay_core::JobId; 1] = harness
        .schedule(ContentId::new(), &["linkedin"], now)
        .await
        .try_into()
        .unwrap();

    // Default budget of 3 attempts.
    for attempt in 1..=3u32 {
        let status = harness
            .run_to_outcome(
                job_id,
                CompletionRequest::failed(Some("publish_error".to_string()), None),
                now,
            )
            .await;
        if attempt < 3 {
            assert_eq!(status, JobStatus::Queued);
        } else {
            assert_eq!(status, JobStatus::Failed);
        }
    }

    let device = harness.device();
    let claimed = harness
        .coordinator
        .claim(harness.tenant, device, Some(10), now)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn content_with_three_platforms_is_published_only_when_all_succeed() {
    let harness = harness();
    let now = Utc::now();
    let content_id = ContentId::new();
    let jobs = harness
        .schedule(content_id, &["linkedin", "x", "facebook"], now)
        .await;

    let device = harness.device();
    let claimed = harness
        .coordinator
        .claim(harness.tenant, device, Some(10), now)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 3);

    for (index, job_id) in jobs.iter().enumerate() {
        harness
            .lifecycle
            .start(harness.tenant, *job_id, device, now)
            .await
            .unwrap();
        let completion = harness
            .lifecycle
            .complete(
                harness.tenant,
                *job_id,
                CompletionRequest::succeeded(Some(format!("post-{index}")), None),
                now,
            )
            .await
            .unwrap();
        assert_eq!(completion.job.status, JobStatus::Succeeded);

        let content_status = harness
            .content
            .status(harness.tenant, content_id)
            .await
            .unwrap();
        if index < jobs.len() - 1 {
            assert_ne!(content_status, Some(ContentStatus::Published));
        } else {
            assert_eq!(content_status, Some(ContentStatus::Published));
        }
    }
}

#[tokio::test]
async fn abandoned_claim_then_two_failures_settles_the_content_as_failed() {
    // The full recovery scenario: max_attempts = 3, three platform jobs
    // for one content item, two of them succeed, the third burns its
    // attempts through one abandoned claim and two reported failures.
    let harness = harness();
    let t0 = Utc::now();
    let content_id = ContentId::new();
    let jobs = harness
        .schedule(content_id, &["linkedin", "x", "facebook"], t0)
        .await;
    let (doomed, healthy) = (jobs[0], &jobs[1..]);

    // D1 claims all three at T0, publishes two of them, and goes silent
    // on the third without ever calling start.
    let d1 = harness.device();
    let claimed = harness
        .coordinator
        .claim(harness.tenant, d1, Some(10), t0)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 3);
    for (index, job_id) in healthy.iter().enumerate() {
        harness
            .lifecycle
            .start(harness.tenant, *job_id, d1, t0)
            .await
            .unwrap();
        harness
            .lifecycle
            .complete(
                harness.tenant,
                *job_id,
                CompletionRequest::succeeded(Some(format!("post-{index}")), None),
                t0,
            )
            .await
            .unwrap();
    }

    // Sweep at T0+6m (claim timeout 5m): requeued, attempt 1, lock clear.
    let report = harness
        .sweeper
        .run_once(t0 + ChronoDuration::minutes(6))
        .await
        .unwrap();
    assert_eq!(report.requeued, 1);
    let job = harness
        .store
        .get(harness.tenant, doomed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt_count, 1);
    assert!(job.locked_by.is_none());

    // D2 at T0+7m: starts and fails. Attempt 2 of 3 → queued again.
    let t1 = t0 + ChronoDuration::minutes(7);
    let status = harness
        .run_to_outcome(
            doomed,
            CompletionRequest::failed(Some("publish_error".to_string()), None),
            t1,
        )
        .await;
    assert_eq!(status, JobStatus::Queued);

    // D3: the third and final attempt.
    let t2 = t0 + ChronoDuration::minutes(8);
    let status = harness
        .run_to_outcome(
            doomed,
            CompletionRequest::failed(Some("publish_error".to_string()), None),
            t2,
        )
        .await;
    assert_eq!(status, JobStatus::Failed);

    let job = harness
        .store
        .get(harness.tenant, doomed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.attempt_count, 3);

    // Two siblings succeeded, one failed, nothing in flight: one failure
    // dominates.
    let content_status = harness
        .content
        .status(harness.tenant, content_id)
        .await
        .unwrap();
    assert_eq!(content_status, Some(ContentStatus::Failed));
}

#[tokio::test]
async fn terminal_outcomes_emit_exactly_one_event_each() {
    let harness = harness();
    let sub = harness.bus.subscribe();
    let now = Utc::now();
    let content_id = ContentId::new();
    let jobs = harness.schedule(content_id, &["linkedin", "x"], now).await;

    harness
        .run_to_outcome(
            jobs[0],
            CompletionRequest::succeeded(Some("post-1".to_string()), None),
            now,
        )
        .await;
    // Duplicate completion: absorbed, no second event.
    harness
        .lifecycle
        .complete(
            harness.tenant,
            jobs[0],
            CompletionRequest::succeeded(Some("post-1".to_string()), None),
            now,
        )
        .await
        .unwrap();

    let event = sub.try_recv().unwrap();
    assert_eq!(event.job_id, jobs[0]);
    assert_eq!(event.status, JobStatus::Succeeded);
    assert!(sub.try_recv().is_err());
}
