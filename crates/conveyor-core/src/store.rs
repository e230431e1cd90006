use async_trait::async_trait;

use crate::{JobId, JobRecord, JobStatus, NewJob, QueueError};

/// Admin listing filter. `limit`/`offset` page through matching records in
/// id order.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub queue: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            limit: 50,
            ..Default::default()
        }
    }
}

/// Persistence plane holding durable job records.
///
/// `claim_job` is the race-resolving operation: it must be serializable
/// against itself, against `schedule_retry`, and against
/// `mark_completed`/`mark_failed` on the same id. Any linearizable
/// implementation suffices (conditional UPDATE, row lock, single mutex).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Write a new pending record and assign the next monotonic id.
    /// No coordination with the dispatch layer happens here.
    async fn create_job(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Snapshot of a record, or `None`.
    async fn find(&self, id: JobId) -> Result<Option<JobRecord>, QueueError>;

    /// The at-most-one record with this request id and status in
    /// {pending, running}.
    async fn find_active_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<JobRecord>, QueueError>;

    /// Lowest-id pending record in the queue whose `available_at` is past or
    /// null. Used only by the polling dispatch substrate.
    async fn next_pending_job_id(&self, queue: &str) -> Result<Option<JobId>, QueueError>;

    /// Atomic conditional transition pending -> running. Succeeds only when
    /// the record is pending and `available_at` is null or past; of
    /// concurrent callers at most one sees `true`.
    async fn claim_job(&self, id: JobId, worker_id: &str) -> Result<bool, QueueError>;

    /// Unconditional transition to completed.
    async fn mark_completed(
        &self,
        id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<bool, QueueError>;

    /// Unconditional transition to failed.
    async fn mark_failed(
        &self,
        id: JobId,
        error_message: &str,
        error_trace: Option<&str>,
    ) -> Result<bool, QueueError>;

    /// Partial update of the progress fields. Never changes `status`.
    async fn update_progress(
        &self,
        id: JobId,
        progress: Option<i32>,
        message: Option<&str>,
    ) -> Result<bool, QueueError>;

    /// Transition back to pending for a retry: sets `attempts`,
    /// `available_at = now + delay`, clears the lock fields.
    async fn schedule_retry(
        &self,
        id: JobId,
        attempts: i32,
        delay_seconds: u64,
        error_message: Option<&str>,
    ) -> Result<bool, QueueError>;

    /// Return every running record with `locked_at < now - ttl` to pending
    /// with `available_at` cleared. Returns the number of records recovered.
    async fn recover_stale_jobs(&self, ttl_seconds: u64) -> Result<u64, QueueError>;

    async fn list(&self, filter: JobFilter) -> Result<Vec<JobRecord>, QueueError>;

    async fn count(
        &self,
        status: Option<JobStatus>,
        queue: Option<&str>,
    ) -> Result<u64, QueueError>;

    /// Delete completed records older than the given age. Returns the number
    /// deleted.
    async fn prune_completed(&self, older_than_days: u32) -> Result<u64, QueueError>;
}
