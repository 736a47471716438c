//! Recovery sweeper: timeout-driven reclamation of abandoned work.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use postrelay_core::{ContentId, JobId};
use postrelay_events::{EventBus, OutcomeEvent};
use postrelay_publishing::{error_codes, Job, JobStatus, RunClose};

use crate::audit::{AuditEvent, AuditLog};
use crate::content::ContentStore;
use crate::store::{JobStore, OutcomeUpdate};

use super::{recompute_content_status, DispatchError};

/// Sweeper timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    /// How often a sweep runs, independent of request traffic.
    pub interval: Duration,
    /// CLAIMED older than this without a start call is abandoned.
    pub claim_timeout: Duration,
    /// RUNNING without an update for this long is abandoned.
    pub running_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            claim_timeout: Duration::from_secs(300),
            running_timeout: Duration::from_secs(600),
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_running_timeout(mut self, timeout: Duration) -> Self {
        self.running_timeout = timeout;
        self
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed
    }
}

/// Handle to a spawned sweeper. Dropping it leaves the task running;
/// `shutdown` stops it gracefully.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(error) = self.join.await {
            warn!(error = %error, "sweeper task panicked");
        }
    }
}

/// Periodically requeues or terminally fails jobs abandoned by their
/// device. Applies the same attempt-bounded decision as a reported
/// failure; every action leaves an audit record.
///
/// The expiry writes re-check status *and* staleness in their predicates,
/// so a device legitimately starting or completing at the boundary wins
/// and the sweeper's write is a no-op. The open run of a timed-out RUNNING
/// job is force-closed only after the sweeper has won that race, which is
/// what keeps a successful device's run record intact.
pub struct RecoverySweeper<S, B> {
    store: S,
    content: Arc<dyn ContentStore>,
    audit: Arc<dyn AuditLog>,
    bus: B,
    config: SweeperConfig,
}

impl<S, B> RecoverySweeper<S, B>
where
    S: JobStore,
    B: EventBus<OutcomeEvent>,
{
    pub fn new(
        store: S,
        content: Arc<dyn ContentStore>,
        audit: Arc<dyn AuditLog>,
        bus: B,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            content,
            audit,
            bus,
            config,
        }
    }

    /// One full sweep: the stale-CLAIMED scan, the stale-RUNNING scan, and
    /// a content-status recompute for everything touched.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, DispatchError> {
        let mut report = SweepReport::default();
        let mut touched: BTreeSet<(uuid::Uuid, uuid::Uuid)> = BTreeSet::new();

        let claim_cutoff = now
            - chrono::Duration::from_std(self.config.claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        for job in self.store.stale_claimed(claim_cutoff).await? {
            let update = recovery_update(&job, error_codes::CLAIM_TIMEOUT);
            match self
                .store
                .expire_claimed(job.id, claim_cutoff, &update, now)
                .await
            {
                Ok(Some(updated)) => {
                    self.record(&job, &updated, error_codes::CLAIM_TIMEOUT, &mut report);
                    touched.insert((*updated.tenant_id.as_uuid(), *updated.content_id.as_uuid()));
                }
                Ok(None) => {} // the device started in the meantime
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to expire claimed job"),
            }
        }

        let running_cutoff = now
            - chrono::Duration::from_std(self.config.running_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        for job in self.store.stale_running(running_cutoff).await? {
            let update = recovery_update(&job, error_codes::RUNNING_TIMEOUT);
            match self
                .store
                .expire_running(job.id, running_cutoff, &update, now)
                .await
            {
                Ok(Some(updated)) => {
                    self.force_close_run(job.id, now).await;
                    self.record(&job, &updated, error_codes::RUNNING_TIMEOUT, &mut report);
                    touched.insert((*updated.tenant_id.as_uuid(), *updated.content_id.as_uuid()));
                }
                Ok(None) => {} // the device completed in the meantime
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to expire running job"),
            }
        }

        for (tenant_uuid, content_uuid) in touched {
            recompute_content_status(
                &self.store,
                &*self.content,
                tenant_uuid.into(),
                ContentId::from_uuid(content_uuid),
            )
            .await;
        }

        Ok(report)
    }

    /// Spawn the periodic background task.
    pub fn spawn(self) -> SweeperHandle
    where
        S: 'static,
        B: 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval = self.config.interval;

        let join = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "recovery sweeper started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        match self.run_once(Utc::now()).await {
                            Ok(report) if report.total() > 0 => {
                                info!(
                                    requeued = report.requeued,
                                    failed = report.failed,
                                    "recovery sweep reclaimed abandoned jobs"
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!(error = %e, "recovery sweep failed"),
                        }
                    }
                }
            }
            info!("recovery sweeper stopped");
        });

        SweeperHandle {
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn force_close_run(&self, job_id: JobId, now: DateTime<Utc>) {
        match self.store.open_run(job_id).await {
            Ok(Some(run)) => {
                if let Err(error) = self
                    .store
                    .close_run(run.id, &RunClose::failed("timeout"), now)
                    .await
                {
                    warn!(job_id = %job_id, error = %error, "failed to force-close run");
                }
            }
            Ok(None) => {}
            Err(error) => warn!(job_id = %job_id, error = %error, "failed to look up open run"),
        }
    }

    fn record(&self, before: &Job, after: &Job, reason: &str, report: &mut SweepReport) {
        self.audit.record(AuditEvent::JobRecovered {
            tenant_id: after.tenant_id,
            job_id: after.id,
            previous_status: before.status,
            new_status: after.status,
            attempt_count: after.attempt_count,
            reason: reason.to_string(),
        });

        match after.status {
            JobStatus::Queued => report.requeued += 1,
            JobStatus::Failed => {
                report.failed += 1;
                let event = OutcomeEvent {
                    tenant_id: after.tenant_id,
                    job_id: after.id,
                    content_id: after.content_id,
                    platform: after.platform.clone(),
                    status: after.status,
                    error_message: after.last_error_message.clone(),
                    occurred_at: after.updated_at,
                };
                if let Err(error) = self.bus.publish(event) {
                    warn!(job_id = %after.id, error = ?error, "failed to publish outcome event");
                }
            }
            _ => {}
        }
    }
}

/// The requeue-or-terminal-fail decision, identical to a reported FAILED
/// outcome: this failure counts as an attempt, and the lock is cleared
/// either way.
fn recovery_update(job: &Job, code: &str) -> OutcomeUpdate {
    let message = match code {
        error_codes::CLAIM_TIMEOUT => "device never started the claimed job",
        error_codes::RUNNING_TIMEOUT => "device never reported an outcome",
        _ => "lease expired",
    };
    if job.attempts_remaining_after(job.attempt_count + 1) {
        OutcomeUpdate::retry(Some(code.to_string()), Some(message.to_string()))
    } else {
        OutcomeUpdate::terminal_failure(Some(code.to_string()), Some(message.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditLog;
    use crate::content::InMemoryContentStore;
    use crate::store::{InMemoryJobStore, Materialized};
    use postrelay_core::{DeviceId, GroupId, TenantId};
    use postrelay_events::InMemoryEventBus;
    use postrelay_publishing::{ContentStatus, NewJob, Platform, RunStatus};

    type TestSweeper = RecoverySweeper<Arc<InMemoryJobStore>, Arc<InMemoryEventBus<OutcomeEvent>>>;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        content: Arc<InMemoryContentStore>,
        audit: Arc<InMemoryAuditLog>,
        bus: Arc<InMemoryEventBus<OutcomeEvent>>,
        sweeper: TestSweeper,
        tenant: TenantId,
        device: DeviceId,
    }

    fn fixture(config: SweeperConfig) -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let content = Arc::new(InMemoryContentStore::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let sweeper = RecoverySweeper::new(
            store.clone(),
            content.clone(),
            audit.clone(),
            bus.clone(),
            config,
        );
        Fixture {
            store,
            content,
            audit,
            bus,
            sweeper,
            tenant: TenantId::new(),
            device: DeviceId::new(),
        }
    }

    async fn claimed_job(fixture: &Fixture, max_attempts: u32, at: DateTime<Utc>) -> Job {
        let draft = NewJob::new(
            fixture.tenant,
            ContentId::new(),
            GroupId::new(),
            Platform::from("linkedin"),
            at,
            max_attempts,
        );
        let Materialized::Created(job) = fixture.store.materialize(draft, at).await.unwrap()
        else {
            panic!("expected a fresh job");
        };
        fixture
            .store
            .claim_batch(fixture.tenant, fixture.device, None, 1, at)
            .await
            .unwrap();
        fixture
            .store
            .get(fixture.tenant, job.id)
            .await
            .unwrap()
            .unwrap()
    }

    fn config() -> SweeperConfig {
        SweeperConfig::default()
            .with_claim_timeout(Duration::from_secs(300))
            .with_running_timeout(Duration::from_secs(600))
    }

    #[tokio::test]
    async fn stale_claim_is_requeued_with_lock_cleared() {
        let fixture = fixture(config());
        let t0 = Utc::now();
        let job = claimed_job(&fixture, 3, t0).await;

        // 6 minutes later: past the 5-minute claim timeout.
        let report = fixture
            .sweeper
            .run_once(t0 + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(report, SweepReport { requeued: 1, failed: 0 });

        let swept = fixture
            .store
            .get(fixture.tenant, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(swept.status, JobStatus::Queued);
        assert_eq!(swept.attempt_count, 1);
        assert!(swept.locked_by.is_none());
        assert!(swept.locked_at.is_none());
        assert_eq!(swept.last_error_code.as_deref(), Some(error_codes::CLAIM_TIMEOUT));

        let events = fixture.audit.events();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn fresh_claim_is_left_alone() {
        let fixture = fixture(config());
        let t0 = Utc::now();
        let job = claimed_job(&fixture, 3, t0).await;

        let report = fixture
            .sweeper
            .run_once(t0 + chrono::Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(report.total(), 0);

        let untouched = fixture
            .store
            .get(fixture.tenant, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, JobStatus::Claimed);
    }

    #[tokio::test]
    async fn stale_claim_with_exhausted_attempts_fails_terminally() {
        let fixture = fixture(config());
        let sub = fixture.bus.subscribe();
        let t0 = Utc::now();
        // One attempt budget: the first timeout is also the last.
        let job = claimed_job(&fixture, 1, t0).await;

        let report = fixture
            .sweeper
            .run_once(t0 + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(report, SweepReport { requeued: 0, failed: 1 });

        let swept = fixture
            .store
            .get(fixture.tenant, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(swept.status, JobStatus::Failed);
        assert!(swept.locked_by.is_none());

        // Terminal failure notifies and settles the content record.
        assert_eq!(sub.try_recv().unwrap().status, JobStatus::Failed);
        let status = fixture
            .content
            .status(fixture.tenant, swept.content_id)
            .await
            .unwrap();
        assert_eq!(status, Some(ContentStatus::Failed));

        // Never claimable again.
        let claimed = fixture
            .store
            .claim_batch(
                fixture.tenant,
                DeviceId::new(),
                None,
                10,
                t0 + chrono::Duration::minutes(7),
            )
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn stale_running_job_gets_its_run_force_closed() {
        let fixture = fixture(config());
        let t0 = Utc::now();
        let job = claimed_job(&fixture, 3, t0).await;
        let (_, run) = fixture
            .store
            .begin_run(job.id, fixture.device, t0)
            .await
            .unwrap()
            .unwrap();

        // 11 minutes of silence: past the 10-minute running timeout.
        let report = fixture
            .sweeper
            .run_once(t0 + chrono::Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(report, SweepReport { requeued: 1, failed: 0 });

        let swept = fixture
            .store
            .get(fixture.tenant, job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(swept.status, JobStatus::Queued);
        assert_eq!(swept.last_error_code.as_deref(), Some(error_codes::RUNNING_TIMEOUT));

        let closed = fixture.store.runs_for_job(job.id).await.unwrap();
        assert_eq!(closed[0].id, run.id);
        assert_eq!(closed[0].status, RunStatus::Failed);
        assert_eq!(closed[0].failure_reason.as_deref(), Some("timeout"));
        assert!(closed[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn running_within_timeout_is_left_alone() {
        let fixture = fixture(config());
        let t0 = Utc::now();
        let job = claimed_job(&fixture, 3, t0).await;
        fixture
            .store
            .begin_run(job.id, fixture.device, t0)
            .await
            .unwrap();

        // Past the claim timeout, but the job is RUNNING now and fresh.
        let report = fixture
            .sweeper
            .run_once(t0 + chrono::Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(report.total(), 0);
    }

    #[tokio::test]
    async fn spawned_sweeper_recovers_and_shuts_down() {
        let fixture = fixture(
            config()
                .with_interval(Duration::from_millis(20))
                .with_claim_timeout(Duration::from_millis(1)),
        );
        let t0 = Utc::now() - chrono::Duration::minutes(1);
        let job = claimed_job(&fixture, 3, t0).await;

        let store = fixture.store.clone();
        let handle = fixture.sweeper.spawn();

        // Give the periodic task a couple of ticks.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown().await;

        let swept = store.get(fixture.tenant, job.id).await.unwrap().unwrap();
        assert_eq!(swept.status, JobStatus::Queued);
    }
}
