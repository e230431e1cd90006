//! The coordination core: claim protocol, handler invocation, progress
//! relay, retry/backoff, crash-recovery sweeps, and graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use conveyor_core::{
    DispatchLayer, HandlerRegistry, JobId, JobRecord, ProgressReporter, QueueError, StateStore,
};

use crate::config::WorkerConfig;
use crate::lock::SingletonLock;
use crate::metrics;

/// Bound on a stored error trace.
const ERROR_TRACE_LIMIT: usize = 4000;
const TRUNCATION_MARKER: &str = "... [truncated]";

/// `min(max, base^attempt)` in whole seconds; `attempt` is the 1-based
/// index of the attempt that just failed.
fn retry_delay(base: u64, max: u64, attempt: u32) -> u64 {
    base.saturating_pow(attempt).min(max)
}

fn truncate_trace(trace: &str, limit: usize) -> String {
    if trace.chars().count() <= limit {
        return trace.to_string();
    }
    let mut out: String = trace.chars().take(limit).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

pub struct Worker {
    store: Arc<dyn StateStore>,
    dispatch: Arc<dyn DispatchLayer>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    worker_id: String,
    should_run: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn StateStore>,
        dispatch: Arc<dyn DispatchLayer>,
        registry: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            dispatch,
            registry,
            config,
            worker_id: default_worker_id(),
            should_run: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Override the `<hostname>:<pid>` scheme. Multiple workers in one
    /// process must use distinct ids.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Request shutdown; the in-flight attempt (if any) runs to completion.
    pub fn stop(&self) {
        self.should_run.store(false, Ordering::SeqCst);
    }

    /// One-shot stale sweep of both substrates. The sweeps are independent
    /// and idempotent; the combined count is returned.
    pub async fn recover_stale(&self) -> u64 {
        let from_store = match self
            .store
            .recover_stale_jobs(self.config.stuck_ttl_seconds)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "state store stale sweep failed");
                0
            }
        };
        let from_dispatch = match self
            .dispatch
            .recover_stale_processing(&self.config.queue, self.config.stuck_ttl_seconds)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "dispatch layer stale sweep failed");
                0
            }
        };
        let total = from_store + from_dispatch;
        metrics::STALE_RECOVERED.inc_by(total);
        total
    }

    /// One main-loop iteration: promote due retries, dequeue, claim,
    /// execute, settle. Returns whether a dispatch token was consumed.
    pub async fn process_one(&self) -> Result<bool, QueueError> {
        // Promotion runs before dequeue so a just-due retry is visible to
        // this very iteration.
        if let Err(e) = self.dispatch.promote_delayed(&self.config.queue).await {
            tracing::warn!(error = %e, "delayed promotion failed");
        }

        let Some(job_id) = self
            .dispatch
            .dequeue(&self.config.queue, self.config.poll_timeout_seconds)
            .await?
        else {
            return Ok(false);
        };

        let claimed = match self.store.claim_job(job_id, &self.worker_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                // No ack: the substrate's stale recovery will return the id
                // to ready, preserving at-least-once delivery.
                tracing::error!(job_id, error = %e, "claim failed, leaving token in flight");
                return Ok(true);
            }
        };

        if !claimed {
            // Another worker owns the record, or it left pending through an
            // admin path. The token was delivered to us, so releasing it is
            // ours to do.
            tracing::debug!(job_id, "claim lost, releasing dispatch token");
            metrics::CLAIMS_LOST.inc();
            self.ack_guarded(job_id).await;
            return Ok(true);
        }
        metrics::JOBS_CLAIMED.inc();

        let record = match self.store.find(job_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::warn!(job_id, "record missing after claim");
                self.ack_guarded(job_id).await;
                return Ok(true);
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "fetch after claim failed, leaving token in flight");
                return Ok(true);
            }
        };

        let span = tracing::info_span!(
            "job",
            job_id = record.id,
            queue = %record.queue,
            job_type = %record.job_type,
            attempt = record.attempts + 1
        );
        self.execute_and_settle(record).instrument(span).await;
        Ok(true)
    }

    async fn execute_and_settle(&self, job: JobRecord) {
        let progress = ProgressReporter::new(self.store.clone(), job.id);
        let outcome = match self.registry.resolve(&job.job_type) {
            Ok(handler) => handler.handle(job.id, job.payload.clone(), progress).await,
            // Unknown type takes the normal failure path and exhausts
            // attempts like any other handler error.
            Err(e) => Err(anyhow::Error::new(e)),
        };

        match outcome {
            Ok(result) => self.settle_success(&job, result).await,
            Err(err) => self.settle_failure(&job, err).await,
        }
    }

    async fn settle_success(&self, job: &JobRecord, result: serde_json::Value) {
        tracing::info!(job_id = job.id, "job completed");
        if let Err(e) = self.store.mark_completed(job.id, Some(result)).await {
            tracing::error!(job_id = job.id, error = %e, "failed to record completion");
        }
        metrics::JOBS_COMPLETED.inc();
        self.ack_guarded(job.id).await;
    }

    async fn settle_failure(&self, job: &JobRecord, err: anyhow::Error) {
        let attempt_index = job.attempts + 1;
        let message = err.to_string();

        if attempt_index < job.max_attempts {
            let delay = retry_delay(
                self.config.retry_base_delay,
                self.config.retry_max_delay,
                attempt_index.max(1) as u32,
            );
            tracing::warn!(
                job_id = job.id,
                attempt = attempt_index,
                delay_seconds = delay,
                error = %message,
                "attempt failed, scheduling retry"
            );
            if let Err(e) = self
                .store
                .schedule_retry(job.id, attempt_index, delay, Some(&message))
                .await
            {
                tracing::error!(job_id = job.id, error = %e, "failed to schedule retry");
            }
            metrics::JOBS_RETRIED.inc();
            if let Err(e) = self.dispatch.nack(&self.config.queue, job.id, delay).await {
                tracing::warn!(job_id = job.id, error = %e, "nack failed");
            }
        } else {
            let trace = truncate_trace(&format!("{err:?}"), ERROR_TRACE_LIMIT);
            tracing::error!(
                job_id = job.id,
                attempts = attempt_index,
                error = %message,
                "attempts exhausted, failing job"
            );
            if let Err(e) = self
                .store
                .mark_failed(job.id, &message, Some(&trace))
                .await
            {
                tracing::error!(job_id = job.id, error = %e, "failed to record terminal failure");
            }
            metrics::JOBS_FAILED.inc();
            self.ack_guarded(job.id).await;
        }
    }

    async fn ack_guarded(&self, job_id: JobId) {
        if let Err(e) = self.dispatch.ack(&self.config.queue, job_id).await {
            tracing::warn!(job_id, error = %e, "ack failed, id will be swept later");
        }
    }

    /// Run until a shutdown signal or `stop()`. Acquires the singleton
    /// lock first when one is configured; failure to acquire is fatal.
    pub async fn run(&self) -> Result<(), QueueError> {
        let _lock = match &self.config.lock_file {
            Some(path) => Some(SingletonLock::acquire(path)?),
            None => {
                tracing::warn!("no lock file configured, singleton enforcement disabled");
                None
            }
        };

        self.should_run.store(true, Ordering::SeqCst);
        spawn_signal_listener(self.should_run.clone());

        tracing::info!(
            worker_id = %self.worker_id,
            queue = %self.config.queue,
            poll_timeout_s = self.config.poll_timeout_seconds,
            stuck_ttl_s = self.config.stuck_ttl_seconds,
            "worker started"
        );

        let recovered = self.recover_stale().await;
        if recovered > 0 {
            tracing::warn!(recovered, "stale jobs recovered at startup");
        }

        while self.should_run.load(Ordering::SeqCst) {
            match self.process_one().await {
                Ok(true) => {}
                Ok(false) => {
                    // A zero poll timeout makes dequeue non-blocking; don't
                    // spin on an empty queue.
                    if self.config.poll_timeout_seconds == 0 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "worker iteration failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        tracing::info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }
}

fn spawn_signal_listener(should_run: Arc<AtomicBool>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received, finishing current attempt");
        should_run.store(false, Ordering::SeqCst);
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_with_cap() {
        // defaults B=2, M=300
        assert_eq!(retry_delay(2, 300, 1), 2);
        assert_eq!(retry_delay(2, 300, 2), 4);
        assert_eq!(retry_delay(2, 300, 3), 8);
        assert_eq!(retry_delay(2, 300, 4), 16);
        assert_eq!(retry_delay(2, 300, 8), 256);
        // saturation
        assert_eq!(retry_delay(2, 300, 9), 300);
        assert_eq!(retry_delay(2, 300, 64), 300);
    }

    #[test]
    fn backoff_base_zero_means_immediate_retry() {
        assert_eq!(retry_delay(0, 300, 1), 0);
        assert_eq!(retry_delay(0, 300, 5), 0);
    }

    #[test]
    fn trace_truncation_marks_the_cut() {
        let short = "boom";
        assert_eq!(truncate_trace(short, 4000), "boom");

        let long = "x".repeat(5000);
        let truncated = truncate_trace(&long, 4000);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            truncated.chars().count(),
            4000 + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn worker_id_scheme_is_host_and_pid() {
        let id = default_worker_id();
        assert!(id.contains(':'));
        assert!(id.ends_with(&std::process::id().to_string()));
    }
}
