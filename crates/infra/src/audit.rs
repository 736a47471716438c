//! Audit trail port (fire-and-forget).

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use postrelay_core::{ContentId, JobId, TenantId};
use postrelay_publishing::{JobStatus, Platform};

/// Operationally interesting queue events: creations, recovery actions,
/// cancellations. Recording must never fail the triggering operation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    JobMaterialized {
        tenant_id: TenantId,
        job_id: JobId,
        content_id: ContentId,
        platform: Platform,
        scheduled_at: DateTime<Utc>,
    },
    JobRecovered {
        tenant_id: TenantId,
        job_id: JobId,
        previous_status: JobStatus,
        new_status: JobStatus,
        attempt_count: u32,
        reason: String,
    },
    JobCancelled {
        tenant_id: TenantId,
        job_id: JobId,
        previous_status: JobStatus,
    },
}

/// Audit collaborator.
pub trait AuditLog: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Production adapter: structured log lines.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, event: AuditEvent) {
        match &event {
            AuditEvent::JobMaterialized {
                tenant_id,
                job_id,
                platform,
                ..
            } => {
                tracing::info!(
                    audit = "job_materialized",
                    tenant_id = %tenant_id,
                    job_id = %job_id,
                    platform = %platform,
                    "job materialized"
                );
            }
            AuditEvent::JobRecovered {
                tenant_id,
                job_id,
                previous_status,
                new_status,
                attempt_count,
                reason,
            } => {
                tracing::warn!(
                    audit = "job_recovered",
                    tenant_id = %tenant_id,
                    job_id = %job_id,
                    previous_status = %previous_status,
                    new_status = %new_status,
                    attempt_count,
                    reason,
                    "job recovered by sweeper"
                );
            }
            AuditEvent::JobCancelled {
                tenant_id,
                job_id,
                previous_status,
            } => {
                tracing::info!(
                    audit = "job_cancelled",
                    tenant_id = %tenant_id,
                    job_id = %job_id,
                    previous_status = %previous_status,
                    "job cancelled"
                );
            }
        }
    }
}

/// Recording adapter for tests.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit lock poisoned").clone()
    }
}

impl AuditLog for InMemoryAuditLog {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
