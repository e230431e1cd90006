use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue this worker drains.
    pub queue: String,
    /// Blocking dequeue timeout (s).
    pub poll_timeout_seconds: u64,
    /// Stale-claim recovery threshold (s). A recovery threshold, not a
    /// hard kill: in-flight attempts are never interrupted.
    pub stuck_ttl_seconds: u64,
    /// Exponential backoff base (s).
    pub retry_base_delay: u64,
    /// Upper bound on a retry delay (s).
    pub retry_max_delay: u64,
    /// Advisory singleton lock path; `None` disables enforcement.
    pub lock_file: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: conveyor_core::DEFAULT_QUEUE.to_string(),
            poll_timeout_seconds: 5,
            stuck_ttl_seconds: 600,
            retry_base_delay: 2,
            retry_max_delay: 300,
            lock_file: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let queue = std::env::var("QUEUE_NAME").unwrap_or(defaults.queue);
        let poll_timeout_seconds = std::env::var("POLL_TIMEOUT_S")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.poll_timeout_seconds);
        let stuck_ttl_seconds = std::env::var("STUCK_TTL_S")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.stuck_ttl_seconds);
        let retry_base_delay = std::env::var("RETRY_BASE_DELAY_S")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.retry_base_delay);
        let retry_max_delay = std::env::var("RETRY_MAX_DELAY_S")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.retry_max_delay);
        let lock_file = std::env::var("LOCK_FILE").ok().map(PathBuf::from);

        Self {
            queue,
            poll_timeout_seconds,
            stuck_ttl_seconds,
            retry_base_delay,
            retry_max_delay,
            lock_file,
        }
    }
}
