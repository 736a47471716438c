//! Outcome events emitted on terminal job transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use postrelay_core::{ContentId, JobId, TenantId};
use postrelay_publishing::{JobStatus, Platform};

/// Helper trait for tenant-scoped messages.
///
/// Lets subscribers (notification workers, per-tenant sinks) filter
/// messages without inspecting the payload shape.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

/// Emitted after a job reaches SUCCEEDED or terminal FAILED.
///
/// Published strictly after the outcome write commits; consumers feed the
/// notification collaborator. NEEDS_LOGIN and retryable failures do not
/// emit — only settled outcomes are externally interesting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub content_id: ContentId,
    pub platform: Platform,
    /// SUCCEEDED or FAILED.
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl TenantScoped for OutcomeEvent {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
