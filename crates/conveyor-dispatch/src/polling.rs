//! Polling dispatch substrate: the state store is authoritative, so
//! enqueue/ack/nack are no-ops and dequeue loops over the store's
//! next-pending query. The store's `available_at` and `status` stand in
//! for the delayed and in-flight structures of richer substrates.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use conveyor_core::{DispatchLayer, JobId, QueueError, StateStore};

/// Poll intervals below this are clamped up.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct PollingDispatch {
    store: Arc<dyn StateStore>,
    poll_interval: Duration,
}

impl PollingDispatch {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(store: Arc<dyn StateStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }
}

#[async_trait]
impl DispatchLayer for PollingDispatch {
    async fn is_available(&self) -> bool {
        true
    }

    async fn enqueue(&self, _queue: &str, _job_id: JobId) -> Result<(), QueueError> {
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        timeout_seconds: u64,
    ) -> Result<Option<JobId>, QueueError> {
        if timeout_seconds == 0 {
            return self.store.next_pending_job_id(queue).await;
        }

        let deadline = Instant::now() + Duration::from_secs(timeout_seconds);
        loop {
            if let Some(id) = self.store.next_pending_job_id(queue).await? {
                return Ok(Some(id));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn ack(&self, _queue: &str, _job_id: JobId) -> Result<(), QueueError> {
        Ok(())
    }

    async fn nack(
        &self,
        _queue: &str,
        _job_id: JobId,
        _delay_seconds: u64,
    ) -> Result<(), QueueError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::NewJob;
    use conveyor_store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn poll_interval_is_floor_clamped() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = PollingDispatch::with_poll_interval(store, Duration::from_millis(1));
        assert_eq!(dispatch.poll_interval, MIN_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn nonblocking_dequeue_reflects_the_store() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = PollingDispatch::new(store.clone());

        assert_eq!(dispatch.dequeue("default", 0).await.unwrap(), None);

        let id = store.create_job(NewJob::new("t", json!({}))).await.unwrap();
        assert_eq!(dispatch.dequeue("default", 0).await.unwrap(), Some(id));
        // No in-flight tracking: the id stays visible until claimed.
        assert_eq!(dispatch.dequeue("default", 0).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn blocking_dequeue_sees_a_late_arrival() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = Arc::new(PollingDispatch::with_poll_interval(
            store.clone(),
            Duration::from_millis(50),
        ));

        let waiter = dispatch.clone();
        let handle = tokio::spawn(async move { waiter.dequeue("default", 5).await });

        tokio::time::sleep(Duration::from_millis(150)).await;
        let id = store.create_job(NewJob::new("t", json!({}))).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("dequeue should return before its 5s timeout")
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(id));
    }

    #[tokio::test]
    async fn blocking_dequeue_times_out_on_empty_store() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = PollingDispatch::new(store);
        assert_eq!(dispatch.dequeue("default", 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn optional_capabilities_default_to_no_work() {
        let store = Arc::new(MemoryStore::new());
        let dispatch = PollingDispatch::new(store);
        assert_eq!(dispatch.promote_delayed("default").await.unwrap(), 0);
        assert_eq!(
            dispatch
                .recover_stale_processing("default", 600)
                .await
                .unwrap(),
            0
        );
    }
}
