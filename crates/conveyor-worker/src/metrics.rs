use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static JOBS_CLAIMED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_claimed_total", "Total jobs claimed").unwrap());

pub static JOBS_COMPLETED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_completed_total", "Total jobs completed").unwrap());

pub static JOBS_RETRIED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_retried_total", "Total attempts that scheduled a retry").unwrap());

pub static JOBS_FAILED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("jobs_failed_total", "Total jobs terminally failed").unwrap());

pub static CLAIMS_LOST: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("claims_lost_total", "Dequeued ids whose claim was lost").unwrap());

pub static STALE_RECOVERED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("stale_recovered_total", "Stale jobs returned to pending").unwrap());

pub fn init_metrics() {
    // Ignore errors if called multiple times (common in tests)
    let _ = REGISTRY.register(Box::new(JOBS_CLAIMED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_COMPLETED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_RETRIED.clone()));
    let _ = REGISTRY.register(Box::new(JOBS_FAILED.clone()));
    let _ = REGISTRY.register(Box::new(CLAIMS_LOST.clone()));
    let _ = REGISTRY.register(Box::new(STALE_RECOVERED.clone()));
}

pub fn gather() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}
