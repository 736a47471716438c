//! Run records — one execution attempt of a job by one device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use postrelay_core::{DeviceId, JobId, RunId};

/// Status of a single execution attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    NeedsLogin,
}

impl RunStatus {
    /// A run is open until a terminal-for-this-attempt outcome closes it.
    pub fn is_open(&self) -> bool {
        matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::NeedsLogin => "needs_login",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = postrelay_core::DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "needs_login" => Ok(RunStatus::NeedsLogin),
            other => Err(postrelay_core::DomainError::validation(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

/// One execution attempt of a job.
///
/// Opened when the job transitions to RUNNING; closed when the attempt
/// reaches an outcome — including forced closure by the recovery sweeper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub job_id: JobId,
    pub device_id: DeviceId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Reference to the published artifact (post id, permalink, …).
    pub artifact_ref: Option<String>,
    pub published_url: Option<String>,
    pub failure_reason: Option<String>,
    /// Free-form device log payload.
    pub logs: Option<serde_json::Value>,
}

impl Run {
    /// Open a new run for a job that just started executing.
    pub fn open(job_id: JobId, device_id: DeviceId, now: DateTime<Utc>) -> Self {
        Self {
            id: RunId::new(),
            job_id,
            device_id,
            status: RunStatus::Running,
            started_at: now,
            finished_at: None,
            artifact_ref: None,
            published_url: None,
            failure_reason: None,
            logs: None,
        }
    }
}

/// Closing update for an open run.
#[derive(Debug, Clone, Default)]
pub struct RunClose {
    pub status: Option<RunStatus>,
    pub artifact_ref: Option<String>,
    pub published_url: Option<String>,
    pub failure_reason: Option<String>,
    pub logs: Option<serde_json::Value>,
}

impl RunClose {
    pub fn succeeded(artifact_ref: Option<String>, published_url: Option<String>) -> Self {
        Self {
            status: Some(RunStatus::Succeeded),
            artifact_ref,
            published_url,
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn needs_login() -> Self {
        Self {
            status: Some(RunStatus::NeedsLogin),
            failure_reason: Some("login required".to_string()),
            ..Default::default()
        }
    }

    pub fn with_logs(mut self, logs: Option<serde_json::Value>) -> Self {
        self.logs = logs;
        self
    }
}
