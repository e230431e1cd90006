use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::QueueError;

/// Monotonic positive id assigned by the state store at creation.
pub type JobId = i64;

/// Queue used when the producer does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Attempt bound used when the producer does not supply one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QueueError> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(QueueError::InvalidState),
        }
    }

    /// Terminal statuses never transition again (except administrative prune).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable per-job record held by the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    pub payload: serde_json::Value,

    pub attempts: i32,
    pub max_attempts: i32,

    /// Earliest claim time while pending; `None` means immediately eligible.
    pub available_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Non-null exactly while `status == Running`.
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
    pub error_trace: Option<String>,

    pub progress: Option<i32>,
    pub progress_message: Option<String>,

    pub result: Option<serde_json::Value>,

    /// Producer correlation string; the idempotency key.
    pub request_id: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Creation input for `StateStore::create_job`. Defaults are resolved by the
/// dispatcher before the store sees the value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub queue: String,
    pub max_attempts: i32,
    pub request_id: Option<String>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_id: None,
        }
    }
}
