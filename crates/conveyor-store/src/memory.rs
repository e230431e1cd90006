//! In-memory state store with the same contract as the durable substrate.
//! Ids are still monotonic. Intended for tests and embedded development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::sync::Mutex;

use conveyor_core::{
    JobFilter, JobId, JobRecord, JobStatus, NewJob, QueueError, StateStore,
};

#[derive(Default)]
struct Inner {
    next_id: JobId,
    jobs: BTreeMap<JobId, JobRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn eligible_now(record: &JobRecord) -> bool {
    record.status == JobStatus::Pending
        && record.available_at.map(|at| at <= Utc::now()).unwrap_or(true)
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_job(&self, job: NewJob) -> Result<JobId, QueueError> {
        let mut inner = self.inner.lock().await;

        // Same guarantee as the relational substrate's unique partial index.
        if let Some(request_id) = &job.request_id {
            let duplicate = inner.jobs.values().any(|r| {
                r.request_id.as_deref() == Some(request_id.as_str()) && !r.status.is_terminal()
            });
            if duplicate {
                return Err(QueueError::Database(format!(
                    "active job already exists for request id: {request_id}"
                )));
            }
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let now = Utc::now();
        inner.jobs.insert(
            id,
            JobRecord {
                id,
                queue: job.queue,
                job_type: job.job_type,
                status: JobStatus::Pending,
                payload: job.payload,
                attempts: 0,
                max_attempts: job.max_attempts,
                available_at: None,
                started_at: None,
                completed_at: None,
                locked_by: None,
                locked_at: None,
                error_message: None,
                error_trace: None,
                progress: None,
                progress_message: None,
                result: None,
                request_id: job.request_id,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn find_active_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<JobRecord>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .find(|r| r.request_id.as_deref() == Some(request_id) && !r.status.is_terminal())
            .cloned())
    }

    async fn next_pending_job_id(&self, queue: &str) -> Result<Option<JobId>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .find(|r| r.queue == queue && eligible_now(r))
            .map(|r| r.id))
    }

    async fn claim_job(&self, id: JobId, worker_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if !eligible_now(record) {
            return Ok(false);
        }
        let now = Utc::now();
        record.status = JobStatus::Running;
        record.locked_by = Some(worker_id.to_string());
        record.locked_at = Some(now);
        if record.started_at.is_none() {
            record.started_at = Some(now);
        }
        record.updated_at = now;
        Ok(true)
    }

    async fn mark_completed(
        &self,
        id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        let now = Utc::now();
        record.status = JobStatus::Completed;
        record.result = result;
        record.completed_at = Some(now);
        record.locked_by = None;
        record.locked_at = None;
        record.updated_at = now;
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: JobId,
        error_message: &str,
        error_trace: Option<&str>,
    ) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        let now = Utc::now();
        record.status = JobStatus::Failed;
        // The terminal failing attempt is a completed attempt too.
        record.attempts = (record.attempts + 1).min(record.max_attempts);
        record.error_message = Some(error_message.to_string());
        record.error_trace = error_trace.map(str::to_string);
        record.completed_at = Some(now);
        record.locked_by = None;
        record.locked_at = None;
        record.updated_at = now;
        Ok(true)
    }

    async fn update_progress(
        &self,
        id: JobId,
        progress: Option<i32>,
        message: Option<&str>,
    ) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if let Some(progress) = progress {
            record.progress = Some(progress);
        }
        if let Some(message) = message {
            record.progress_message = Some(message.to_string());
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        attempts: i32,
        delay_seconds: u64,
        error_message: Option<&str>,
    ) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let Some(record) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        let now = Utc::now();
        record.status = JobStatus::Pending;
        record.attempts = attempts;
        record.available_at = Some(now + Duration::seconds(delay_seconds as i64));
        record.locked_by = None;
        record.locked_at = None;
        if let Some(message) = error_message {
            record.error_message = Some(message.to_string());
        }
        record.updated_at = now;
        Ok(true)
    }

    async fn recover_stale_jobs(&self, ttl_seconds: u64) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - Duration::seconds(ttl_seconds as i64);
        let mut recovered = 0;
        for record in inner.jobs.values_mut() {
            if record.status == JobStatus::Running
                && record.locked_at.map(|at| at < cutoff).unwrap_or(false)
            {
                record.status = JobStatus::Pending;
                record.available_at = None;
                record.locked_by = None;
                record.locked_at = None;
                record.updated_at = Utc::now();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<JobRecord>, QueueError> {
        let inner = self.inner.lock().await;
        let limit = filter.limit.clamp(1, 500) as usize;
        let offset = filter.offset.max(0) as usize;
        Ok(inner
            .jobs
            .values()
            .filter(|r| filter.status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| {
                filter
                    .queue
                    .as_deref()
                    .map(|q| r.queue == q)
                    .unwrap_or(true)
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count(
        &self,
        status: Option<JobStatus>,
        queue: Option<&str>,
    ) -> Result<u64, QueueError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .filter(|r| queue.map(|q| r.queue == q).unwrap_or(true))
            .count() as u64)
    }

    async fn prune_completed(&self, older_than_days: u32) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().await;
        let cutoff = Utc::now() - Duration::days(older_than_days as i64);
        let doomed: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|r| {
                r.status == JobStatus::Completed
                    && r.completed_at.map(|at| at < cutoff).unwrap_or(false)
            })
            .map(|r| r.id)
            .collect();
        for id in &doomed {
            inner.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}
