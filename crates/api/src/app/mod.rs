//! App wiring: services, router, backend selection.

use std::sync::Arc;

use axum::{middleware as axum_middleware, routing::get, Extension, Router};
use sqlx::postgres::PgPoolOptions;

use postrelay_events::{EventBus, InMemoryEventBus, OutcomeEvent};
use postrelay_publishing::QueuePolicy;

use postrelay_infra::audit::TracingAuditLog;
use postrelay_infra::content::InMemoryContentStore;
use postrelay_infra::directory::InMemoryDeviceDirectory;
use postrelay_infra::dispatch::{
    ClaimCoordinator, JobCreator, LifecycleManager, RecoverySweeper, SweeperConfig, SweeperHandle,
};
use postrelay_infra::store::{InMemoryJobStore, JobStore, PostgresJobStore};

pub mod dto;
pub mod errors;
pub mod routes;

type SharedStore = Arc<dyn JobStore>;
type SharedBus = Arc<InMemoryEventBus<OutcomeEvent>>;

/// The services the handlers work with.
pub struct AppServices {
    pub store: SharedStore,
    pub creator: JobCreator<SharedStore>,
    pub coordinator: ClaimCoordinator<SharedStore>,
    pub lifecycle: LifecycleManager<SharedStore, SharedBus>,
}

/// Runtime configuration, read from the environment by the binary.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// When set, jobs and runs persist to Postgres; otherwise the
    /// in-memory store backs everything (dev/test).
    pub database_url: Option<String>,
    pub policy: QueuePolicy,
    pub sweeper: SweeperConfig,
}

/// A built application: the router plus the handles the binary owns.
pub struct AppParts {
    pub router: Router,
    pub sweeper: SweeperHandle,
    /// The device-directory port. The directory is owned by the device
    /// management collaborator; this in-process adapter is the seam tests
    /// and dev tooling seed.
    pub directory: Arc<InMemoryDeviceDirectory>,
    pub bus: SharedBus,
}

/// Build the full application.
///
/// The outcome-event subscriber wired here is the notification
/// collaborator's entry point: it drains terminal outcomes off the bus and
/// forwards them, logging (never propagating) delivery problems.
pub async fn build_app(config: AppConfig) -> anyhow::Result<AppParts> {
    let store: SharedStore = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let store = PostgresJobStore::new(pool);
            store.ensure_schema().await?;
            tracing::info!("job store: postgres");
            Arc::new(store)
        }
        None => {
            tracing::info!("job store: in-memory (no DATABASE_URL set)");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let directory = Arc::new(InMemoryDeviceDirectory::new());
    let content = Arc::new(InMemoryContentStore::new());
    let audit = Arc::new(TracingAuditLog);
    let bus: SharedBus = Arc::new(InMemoryEventBus::new());

    spawn_outcome_logger(&bus);

    let services = Arc::new(AppServices {
        store: store.clone(),
        creator: JobCreator::new(store.clone(), audit.clone(), config.policy),
        coordinator: ClaimCoordinator::new(
            store.clone(),
            directory.clone(),
            content.clone(),
            config.policy,
        ),
        lifecycle: LifecycleManager::new(
            store.clone(),
            content.clone(),
            audit.clone(),
            bus.clone(),
        ),
    });

    let sweeper = RecoverySweeper::new(store, content, audit, bus.clone(), config.sweeper).spawn();

    let router = Router::new()
        .nest("/device", routes::device::router())
        .nest("/api/jobs", routes::jobs::router())
        .layer(axum_middleware::from_fn(crate::middleware::tenant_middleware))
        .route("/healthz", get(routes::system::healthz))
        .layer(Extension(services));

    Ok(AppParts {
        router,
        sweeper,
        directory,
        bus,
    })
}

/// Background subscriber: bus → notification collaborator.
///
/// Stands in for the real delivery mechanism; outcome ordering is already
/// guaranteed (events are published after the outcome write commits).
fn spawn_outcome_logger(bus: &SharedBus) {
    let sub = bus.subscribe();
    tokio::task::spawn_blocking(move || {
        while let Ok(event) = sub.recv() {
            tracing::info!(
                tenant_id = %event.tenant_id,
                job_id = %event.job_id,
                content_id = %event.content_id,
                platform = %event.platform,
                status = %event.status,
                "publish outcome"
            );
        }
    });
}
