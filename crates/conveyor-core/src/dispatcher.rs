use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    DispatchLayer, JobId, JobRecord, NewJob, QueueError, StateStore, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_QUEUE,
};

/// Producer submission. Unset options fall back to the `default` queue and
/// three attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: serde_json::Value,
    pub queue: Option<String>,
    pub max_attempts: Option<i32>,
    pub request_id: Option<String>,
}

impl DispatchRequest {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            queue: None,
            max_attempts: None,
            request_id: None,
        }
    }
}

/// Outcome of an idempotent dispatch: the active or newly created job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentDispatch {
    pub id: JobId,
    pub created: bool,
}

/// Producer-facing submission surface: writes the state record, then hands
/// the id to the dispatch layer.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    dispatch: Arc<dyn DispatchLayer>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn StateStore>, dispatch: Arc<dyn DispatchLayer>) -> Self {
        Self { store, dispatch }
    }

    /// Create the record, then enqueue the id. The order matters: on enqueue
    /// failure the record is left pending and the stale-recovery sweep or
    /// the polling substrate will still discover it.
    pub async fn dispatch(&self, req: DispatchRequest) -> Result<JobId, QueueError> {
        let queue = req.queue.unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        let max_attempts = req.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let id = self
            .store
            .create_job(NewJob {
                job_type: req.job_type.clone(),
                payload: req.payload,
                queue: queue.clone(),
                max_attempts,
                request_id: req.request_id,
            })
            .await?;

        if let Err(e) = self.dispatch.enqueue(&queue, id).await {
            tracing::warn!(job_id = id, %queue, error = %e, "enqueue failed, record left pending");
        } else {
            tracing::debug!(job_id = id, %queue, job_type = %req.job_type, "job dispatched");
        }
        Ok(id)
    }

    /// Sequence of single dispatches; no transactional batching.
    pub async fn dispatch_batch(
        &self,
        job_type: &str,
        payloads: Vec<serde_json::Value>,
        queue: Option<String>,
        max_attempts: Option<i32>,
    ) -> Result<Vec<JobId>, QueueError> {
        let mut ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let id = self
                .dispatch(DispatchRequest {
                    job_type: job_type.to_string(),
                    payload,
                    queue: queue.clone(),
                    max_attempts,
                    request_id: None,
                })
                .await?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Submit unless an active (pending or running) job already carries the
    /// request id. The check-then-insert is not atomic; substrates with a
    /// unique partial index on active request ids turn the residual race
    /// into a store error on the second insert.
    pub async fn dispatch_idempotent(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        request_id: &str,
        queue: Option<String>,
        max_attempts: Option<i32>,
    ) -> Result<IdempotentDispatch, QueueError> {
        if let Some(existing) = self.store.find_active_by_request_id(request_id).await? {
            tracing::debug!(
                job_id = existing.id,
                request_id,
                "active job exists for request id, not dispatching"
            );
            return Ok(IdempotentDispatch {
                id: existing.id,
                created: false,
            });
        }

        let id = self
            .dispatch(DispatchRequest {
                job_type: job_type.to_string(),
                payload,
                queue,
                max_attempts,
                request_id: Some(request_id.to_string()),
            })
            .await?;
        Ok(IdempotentDispatch { id, created: true })
    }

    pub async fn get_status(&self, id: JobId) -> Result<Option<JobRecord>, QueueError> {
        self.store.find(id).await
    }
}
