//! Content record port (external collaborator).
//!
//! Write access is limited to the single status field; the aggregator is
//! the only writer.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use postrelay_core::{ContentId, TenantId};
use postrelay_publishing::ContentStatus;

/// Content collaborator error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContentError {
    #[error("content service unavailable: {0}")]
    Unavailable(String),
}

/// The slice of the content collaborator the queue consumes.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Reference the device uses to fetch the publishable payload.
    async fn payload_ref(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
    ) -> Result<Option<String>, ContentError>;

    async fn set_status(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
        status: ContentStatus,
    ) -> Result<(), ContentError>;

    async fn status(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
    ) -> Result<Option<ContentStatus>, ContentError>;
}

/// In-memory content store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    statuses: RwLock<HashMap<(TenantId, ContentId), ContentStatus>>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn payload_ref(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
    ) -> Result<Option<String>, ContentError> {
        Ok(Some(format!("content://{tenant_id}/{content_id}")))
    }

    async fn set_status(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
        status: ContentStatus,
    ) -> Result<(), ContentError> {
        self.statuses
            .write()
            .map_err(|_| ContentError::Unavailable("content lock poisoned".to_string()))?
            .insert((tenant_id, content_id), status);
        Ok(())
    }

    async fn status(
        &self,
        tenant_id: TenantId,
        content_id: ContentId,
    ) -> Result<Option<ContentStatus>, ContentError> {
        Ok(self
            .statuses
            .read()
            .map_err(|_| ContentError::Unavailable("content lock poisoned".to_string()))?
            .get(&(tenant_id, content_id))
            .copied())
    }
}
