//! Dispatch services: the operations of the publishing queue.
//!
//! Each service borrows the store generically (`S: JobStore`) so the same
//! code runs against Postgres in production and the in-memory store in
//! tests. None of them holds state of its own — the store is the only
//! synchronization point.

use postrelay_core::{ContentId, TenantId};
use postrelay_publishing::aggregate_content_status;

use crate::content::{ContentError, ContentStore};
use crate::directory::DirectoryError;
use crate::store::{JobStore, StoreError};

mod claim;
mod creator;
mod lifecycle;
mod sweeper;

pub use claim::{ClaimCoordinator, ClaimedJob};
pub use creator::{JobCreator, MaterializeRequest};
pub use lifecycle::{Completion, CompletionOutcome, CompletionRequest, LifecycleManager};
pub use sweeper::{RecoverySweeper, SweepReport, SweeperConfig, SweeperHandle};

/// Dispatch operation error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Content(#[from] ContentError),
}

/// Recompute one content record's status from its job set.
///
/// Best-effort: the content status is an eventually-consistent projection,
/// so a failed write is logged and the next terminal transition (or sweep)
/// converges it.
pub(crate) async fn recompute_content_status<S>(
    store: &S,
    content: &dyn ContentStore,
    tenant_id: TenantId,
    content_id: ContentId,
) where
    S: JobStore + ?Sized,
{
    let jobs = match store.jobs_for_content(tenant_id, content_id).await {
        Ok(jobs) => jobs,
        Err(error) => {
            tracing::warn!(
                tenant_id = %tenant_id,
                content_id = %content_id,
                error = %error,
                "failed to load jobs for content status recompute"
            );
            return;
        }
    };

    if let Some(status) = aggregate_content_status(&jobs) {
        if let Err(error) = content.set_status(tenant_id, content_id, status).await {
            tracing::warn!(
                tenant_id = %tenant_id,
                content_id = %content_id,
                error = %error,
                "failed to update content status"
            );
        }
    }
}
