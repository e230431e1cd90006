use async_trait::async_trait;

use crate::{JobId, QueueError};

/// Queueing plane that orders job ids and hands them to workers.
///
/// Delivery is at-least-once: a substrate may replay an id after a worker
/// crash; the worker's claim handshake against the state store deduplicates.
#[async_trait]
pub trait DispatchLayer: Send + Sync {
    /// Health probe.
    async fn is_available(&self) -> bool;

    /// Append the id to the tail of the queue's ready list.
    async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<(), QueueError>;

    /// Take the next id. `timeout_seconds == 0` returns immediately;
    /// a positive timeout blocks up to that long and returns early on
    /// arrival. A returned id logically moves from ready to in-flight and
    /// its claim timestamp is recorded for stale recovery.
    async fn dequeue(&self, queue: &str, timeout_seconds: u64)
        -> Result<Option<JobId>, QueueError>;

    /// Remove the id from the substrate entirely (in-flight, delayed,
    /// ready). Idempotent; ack of an unknown id is a no-op.
    async fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError>;

    /// Remove the id from in-flight; `delay_seconds > 0` parks it in the
    /// delayed set keyed by its availability time, zero re-appends it to
    /// ready. Idempotent with respect to the in-flight state.
    async fn nack(&self, queue: &str, job_id: JobId, delay_seconds: u64)
        -> Result<(), QueueError>;

    /// Move every delayed id whose availability time has passed into the
    /// ready list, atomically per id. Substrates without a delayed set
    /// leave the default, which reports no work.
    async fn promote_delayed(&self, queue: &str) -> Result<u64, QueueError> {
        let _ = queue;
        Ok(0)
    }

    /// Return every in-flight id older than `now - ttl` to the ready list.
    /// Substrates without their own in-flight tracking leave the default.
    async fn recover_stale_processing(
        &self,
        queue: &str,
        ttl_seconds: u64,
    ) -> Result<u64, QueueError> {
        let _ = (queue, ttl_seconds);
        Ok(0)
    }
}
