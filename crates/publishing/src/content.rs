//! Content status aggregation.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobStatus};

/// Publishing status of a content record, derived from its jobs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentStatus {
    Publishing,
    Published,
    Failed,
}

/// Derive a content record's status from the full set of its jobs.
///
/// Pure and idempotent; `None` means "still converging — leave the record
/// unchanged". One terminal failure dominates once nothing is in flight.
pub fn aggregate_content_status(jobs: &[Job]) -> Option<ContentStatus> {
    if jobs.is_empty() {
        return None;
    }

    if jobs.iter().all(|j| j.status == JobStatus::Succeeded) {
        return Some(ContentStatus::Published);
    }

    let any_failed = jobs.iter().any(|j| j.status == JobStatus::Failed);
    let any_in_flight = jobs.iter().any(|j| {
        matches!(
            j.status,
            JobStatus::Queued | JobStatus::Claimed | JobStatus::Running
        )
    });

    if any_failed && !any_in_flight {
        return Some(ContentStatus::Failed);
    }

    if jobs
        .iter()
        .any(|j| matches!(j.status, JobStatus::Claimed | JobStatus::Running))
    {
        return Some(ContentStatus::Publishing);
    }

    None
}
