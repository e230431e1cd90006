//! In-process dispatch substrate with the full ready/in-flight/delayed
//! semantics. Backs the hermetic worker tests and embedded single-process
//! deployments.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use conveyor_core::{DispatchLayer, JobId, QueueError};

const DEQUEUE_TICK: Duration = Duration::from_millis(25);

#[derive(Default)]
struct QueueState {
    ready: VecDeque<JobId>,
    in_flight: HashMap<JobId, DateTime<Utc>>,
    delayed: Vec<(JobId, DateTime<Utc>)>,
}

#[derive(Default)]
pub struct MemoryDispatch {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl MemoryDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// (ready, in-flight, delayed) sizes, for inspection and tests.
    pub async fn depths(&self, queue: &str) -> (usize, usize, usize) {
        let queues = self.queues.lock().await;
        match queues.get(queue) {
            Some(state) => (
                state.ready.len(),
                state.in_flight.len(),
                state.delayed.len(),
            ),
            None => (0, 0, 0),
        }
    }
}

#[async_trait]
impl DispatchLayer for MemoryDispatch {
    async fn is_available(&self) -> bool {
        true
    }

    async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(job_id);
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        timeout_seconds: u64,
    ) -> Result<Option<JobId>, QueueError> {
        let deadline = Instant::now() + Duration::from_secs(timeout_seconds);
        loop {
            {
                let mut queues = self.queues.lock().await;
                let state = queues.entry(queue.to_string()).or_default();
                if let Some(id) = state.ready.pop_front() {
                    state.in_flight.insert(id, Utc::now());
                    return Ok(Some(id));
                }
            }
            if timeout_seconds == 0 || Instant::now() >= deadline {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(DEQUEUE_TICK.min(remaining)).await;
        }
    }

    async fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            state.in_flight.remove(&job_id);
            state.delayed.retain(|(id, _)| *id != job_id);
            state.ready.retain(|id| *id != job_id);
        }
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        job_id: JobId,
        delay_seconds: u64,
    ) -> Result<(), QueueError> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.in_flight.remove(&job_id);
        if delay_seconds > 0 {
            let available_at = Utc::now() + chrono::Duration::seconds(delay_seconds as i64);
            state.delayed.push((job_id, available_at));
        } else {
            state.ready.push_back(job_id);
        }
        Ok(())
    }

    async fn promote_delayed(&self, queue: &str) -> Result<u64, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let now = Utc::now();
        let mut due: Vec<(JobId, DateTime<Utc>)> = Vec::new();
        state.delayed.retain(|entry| {
            if entry.1 <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(_, at)| *at);
        let count = due.len() as u64;
        for (id, _) in due {
            state.ready.push_back(id);
        }
        Ok(count)
    }

    async fn recover_stale_processing(
        &self,
        queue: &str,
        ttl_seconds: u64,
    ) -> Result<u64, QueueError> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - chrono::Duration::seconds(ttl_seconds as i64);
        let stale: Vec<JobId> = state
            .in_flight
            .iter()
            .filter(|(_, taken_at)| **taken_at < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            state.in_flight.remove(id);
            state.ready.push_back(*id);
        }
        Ok(stale.len() as u64)
    }
}
