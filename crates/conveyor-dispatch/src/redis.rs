//! List-and-sorted-set dispatch substrate.
//!
//! Keys are `<prefix>:queue:<q>:{pending|processing|processing_z|delayed}`.
//! `pending` and `processing` are lists with tail-insert / head-take
//! semantics; a dequeue is `LMOVE`/`BLMOVE pending processing LEFT RIGHT`,
//! so the handoff from ready to in-flight is a single server-side step.
//! `processing_z` scores each in-flight id with its claim timestamp for
//! stale recovery; the `ZADD` follows the pop as a best-effort second step,
//! and an id stranded between the two is repaired by the state store's own
//! stale sweep. `delayed` scores parked ids with their availability time.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use conveyor_core::{DispatchLayer, JobId, QueueError};

const DEFAULT_PREFIX: &str = "conveyor";

#[derive(Clone)]
pub struct RedisDispatch {
    conn: ConnectionManager,
    prefix: String,
}

fn dispatch_err(e: redis::RedisError) -> QueueError {
    QueueError::Dispatch(e.to_string())
}

impl RedisDispatch {
    /// Connect with the default key prefix. Raises `DriverNotAvailable`
    /// when the server cannot be reached, at construction rather than on
    /// first use.
    pub async fn connect(url: &str) -> Result<Self, QueueError> {
        Self::connect_with_prefix(url, DEFAULT_PREFIX).await
    }

    pub async fn connect_with_prefix(url: &str, prefix: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)
            .map_err(|e| QueueError::DriverNotAvailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::DriverNotAvailable(e.to_string()))?;
        Ok(Self {
            conn,
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, queue: &str, suffix: &str) -> String {
        format!("{}:queue:{}:{}", self.prefix, queue, suffix)
    }
}

#[async_trait]
impl DispatchLayer for RedisDispatch {
    async fn is_available(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: Result<String, redis::RedisError> =
            redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(self.key(queue, "pending"), job_id)
            .await
            .map_err(dispatch_err)?;
        Ok(())
    }

    async fn dequeue(
        &self,
        queue: &str,
        timeout_seconds: u64,
    ) -> Result<Option<JobId>, QueueError> {
        let mut conn = self.conn.clone();
        let pending = self.key(queue, "pending");
        let processing = self.key(queue, "processing");

        let popped: Option<JobId> = if timeout_seconds == 0 {
            redis::cmd("LMOVE")
                .arg(&pending)
                .arg(&processing)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await
                .map_err(dispatch_err)?
        } else {
            redis::cmd("BLMOVE")
                .arg(&pending)
                .arg(&processing)
                .arg("LEFT")
                .arg("RIGHT")
                .arg(timeout_seconds as f64)
                .query_async(&mut conn)
                .await
                .map_err(dispatch_err)?
        };

        let Some(job_id) = popped else {
            return Ok(None);
        };

        // Best-effort claim timestamp; a crash before this leaves the id in
        // `processing` without a score, which only the state store's sweep
        // can repair.
        let scored: Result<(), redis::RedisError> = conn
            .zadd(self.key(queue, "processing_z"), job_id, Utc::now().timestamp())
            .await;
        if let Err(e) = scored {
            tracing::warn!(job_id, %queue, error = %e, "failed to score in-flight claim");
        }

        Ok(Some(job_id))
    }

    async fn ack(&self, queue: &str, job_id: JobId) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lrem(self.key(queue, "processing"), 0, job_id)
            .await
            .map_err(dispatch_err)?;
        let _: () = conn
            .zrem(self.key(queue, "processing_z"), job_id)
            .await
            .map_err(dispatch_err)?;
        let _: () = conn
            .zrem(self.key(queue, "delayed"), job_id)
            .await
            .map_err(dispatch_err)?;
        let _: () = conn
            .lrem(self.key(queue, "pending"), 0, job_id)
            .await
            .map_err(dispatch_err)?;
        Ok(())
    }

    async fn nack(
        &self,
        queue: &str,
        job_id: JobId,
        delay_seconds: u64,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lrem(self.key(queue, "processing"), 0, job_id)
            .await
            .map_err(dispatch_err)?;
        let _: () = conn
            .zrem(self.key(queue, "processing_z"), job_id)
            .await
            .map_err(dispatch_err)?;

        if delay_seconds > 0 {
            let available_at = Utc::now().timestamp() + delay_seconds as i64;
            let _: () = conn
                .zadd(self.key(queue, "delayed"), job_id, available_at)
                .await
                .map_err(dispatch_err)?;
        } else {
            let _: () = conn
                .rpush(self.key(queue, "pending"), job_id)
                .await
                .map_err(dispatch_err)?;
        }
        Ok(())
    }

    async fn promote_delayed(&self, queue: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let delayed = self.key(queue, "delayed");
        let pending = self.key(queue, "pending");

        let due: Vec<JobId> = conn
            .zrangebyscore(&delayed, "-inf", Utc::now().timestamp())
            .await
            .map_err(dispatch_err)?;

        let mut promoted = 0;
        for job_id in due {
            // ZREM is the per-id atomicity guard: only the caller that
            // removes the member gets to requeue it.
            let removed: i64 = conn
                .zrem(&delayed, job_id)
                .await
                .map_err(dispatch_err)?;
            if removed == 1 {
                let _: () = conn.rpush(&pending, job_id).await.map_err(dispatch_err)?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    async fn recover_stale_processing(
        &self,
        queue: &str,
        ttl_seconds: u64,
    ) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let processing = self.key(queue, "processing");
        let processing_z = self.key(queue, "processing_z");
        let pending = self.key(queue, "pending");

        let cutoff = Utc::now().timestamp() - ttl_seconds as i64;
        let stale: Vec<JobId> = conn
            .zrangebyscore(&processing_z, "-inf", cutoff)
            .await
            .map_err(dispatch_err)?;

        let mut recovered = 0;
        for job_id in stale {
            let removed: i64 = conn
                .zrem(&processing_z, job_id)
                .await
                .map_err(dispatch_err)?;
            if removed == 1 {
                let _: () = conn
                    .lrem(&processing, 0, job_id)
                    .await
                    .map_err(dispatch_err)?;
                let _: () = conn.rpush(&pending, job_id).await.map_err(dispatch_err)?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
