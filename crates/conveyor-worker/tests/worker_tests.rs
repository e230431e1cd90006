//! End-to-end scenarios on the in-memory substrates: happy path, retry,
//! exhaustion, crash recovery, idempotent dispatch, delayed promotion.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use conveyor_core::{
    DispatchLayer, DispatchRequest, Dispatcher, HandlerRegistry, JobHandler, JobId, JobStatus,
    ProgressReporter, StateStore,
};
use conveyor_dispatch::MemoryDispatch;
use conveyor_store::MemoryStore;
use conveyor_worker::{SingletonLock, Worker, WorkerConfig};

struct Harness {
    store: Arc<MemoryStore>,
    dispatch: Arc<MemoryDispatch>,
    registry: Arc<HandlerRegistry>,
    dispatcher: Dispatcher,
    worker: Worker,
}

fn harness_with(config: WorkerConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let dispatch = Arc::new(MemoryDispatch::new());
    let registry = Arc::new(HandlerRegistry::new());

    let store_dyn: Arc<dyn StateStore> = store.clone();
    let dispatch_dyn: Arc<dyn DispatchLayer> = dispatch.clone();

    let dispatcher = Dispatcher::new(store_dyn.clone(), dispatch_dyn.clone());
    let worker = Worker::new(store_dyn, dispatch_dyn, registry.clone(), config)
        .with_worker_id("test:1");

    Harness {
        store,
        dispatch,
        registry,
        dispatcher,
        worker,
    }
}

fn harness() -> Harness {
    harness_with(WorkerConfig {
        poll_timeout_seconds: 0,
        retry_base_delay: 0,
        ..Default::default()
    })
}

struct OkHandler;

#[async_trait]
impl JobHandler for OkHandler {
    async fn handle(
        &self,
        _job_id: JobId,
        _payload: serde_json::Value,
        _progress: ProgressReporter,
    ) -> Result<serde_json::Value> {
        Ok(json!({"ok": true}))
    }
}

/// Fails the first `fail_times` calls, then succeeds.
struct FlakyHandler {
    calls: AtomicU32,
    fail_times: u32,
}

#[async_trait]
impl JobHandler for FlakyHandler {
    async fn handle(
        &self,
        _job_id: JobId,
        _payload: serde_json::Value,
        _progress: ProgressReporter,
    ) -> Result<serde_json::Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            anyhow::bail!("transient failure on call {call}");
        }
        Ok(json!({"recovered": true}))
    }
}

struct AlwaysFails;

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn handle(
        &self,
        _job_id: JobId,
        _payload: serde_json::Value,
        _progress: ProgressReporter,
    ) -> Result<serde_json::Value> {
        anyhow::bail!("broken beyond repair")
    }
}

struct ReportsProgress;

#[async_trait]
impl JobHandler for ReportsProgress {
    async fn handle(
        &self,
        _job_id: JobId,
        _payload: serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value> {
        progress.report(50, Some("halfway")).await;
        progress.report(100, None).await;
        Ok(json!({}))
    }
}

/// Invariant 1: locked fields are set exactly while running.
async fn assert_lock_invariant(store: &MemoryStore) {
    let all = store
        .list(conveyor_core::JobFilter {
            limit: 500,
            ..conveyor_core::JobFilter::new()
        })
        .await
        .unwrap();
    for rec in all {
        let locked = rec.locked_by.is_some() && rec.locked_at.is_some();
        assert_eq!(
            locked,
            rec.status == JobStatus::Running,
            "lock fields out of step for job {} in status {}",
            rec.id,
            rec.status
        );
    }
}

#[tokio::test]
async fn happy_path_completes_and_drains_the_queue() -> Result<()> {
    let h = harness();
    h.registry.register("t", || Arc::new(OkHandler))?;

    let id = h
        .dispatcher
        .dispatch(DispatchRequest::new("t", json!({"x": 1})))
        .await?;

    assert!(h.worker.process_one().await?);

    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Completed);
    assert_eq!(rec.result, Some(json!({"ok": true})));
    assert_eq!(rec.locked_by, None);
    assert!(rec.completed_at.is_some());
    assert_eq!(h.dispatch.depths("default").await, (0, 0, 0));
    assert_lock_invariant(&h.store).await;
    Ok(())
}

#[tokio::test]
async fn dispatch_round_trip_preserves_fields() -> Result<()> {
    let h = harness();
    let id = h
        .dispatcher
        .dispatch(DispatchRequest {
            job_type: "email.send".to_string(),
            payload: json!({"to": "a@example.com"}),
            queue: Some("mail".to_string()),
            max_attempts: Some(5),
            request_id: Some("R-1".to_string()),
        })
        .await?;

    let rec = h.dispatcher.get_status(id).await?.expect("record exists");
    assert_eq!(rec.job_type, "email.send");
    assert_eq!(rec.queue, "mail");
    assert_eq!(rec.payload, json!({"to": "a@example.com"}));
    assert_eq!(rec.max_attempts, 5);
    assert_eq!(rec.request_id.as_deref(), Some("R-1"));
    assert_eq!(rec.status, JobStatus::Pending);
    assert_eq!(rec.attempts, 0);
    Ok(())
}

#[tokio::test]
async fn retry_then_success_keeps_the_attempt_count() -> Result<()> {
    let h = harness();
    // The registry constructs a fresh executor per attempt, so the flaky
    // counter must live on one shared instance.
    let flaky = Arc::new(FlakyHandler {
        calls: AtomicU32::new(0),
        fail_times: 1,
    });
    h.registry.register_instance("t", flaky)?;

    let id = h
        .dispatcher
        .dispatch(DispatchRequest {
            max_attempts: Some(3),
            ..DispatchRequest::new("t", json!({}))
        })
        .await?;

    // First attempt fails and schedules a retry.
    assert!(h.worker.process_one().await?);
    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Pending);
    assert_eq!(rec.attempts, 1);
    assert!(rec.error_message.is_some());
    assert_lock_invariant(&h.store).await;

    // Second attempt succeeds; the successful attempt does not increment.
    assert!(h.worker.process_one().await?);
    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Completed);
    assert_eq!(rec.attempts, 1);
    assert_eq!(rec.result, Some(json!({"recovered": true})));
    Ok(())
}

#[tokio::test]
async fn exhaustion_marks_terminal_failure() -> Result<()> {
    let h = harness();
    h.registry.register("t", || Arc::new(AlwaysFails))?;

    let id = h
        .dispatcher
        .dispatch(DispatchRequest {
            max_attempts: Some(2),
            ..DispatchRequest::new("t", json!({}))
        })
        .await?;

    assert!(h.worker.process_one().await?);
    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Pending);
    assert_eq!(rec.attempts, 1);

    assert!(h.worker.process_one().await?);
    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Failed);
    assert_eq!(rec.attempts, 2);
    assert_eq!(rec.error_message.as_deref(), Some("broken beyond repair"));
    assert!(rec.error_trace.is_some());
    assert!(rec.completed_at.is_some());
    assert_eq!(h.dispatch.depths("default").await, (0, 0, 0));
    assert_lock_invariant(&h.store).await;
    Ok(())
}

#[tokio::test]
async fn startup_sweep_recovers_a_crashed_worker() -> Result<()> {
    let h = harness_with(WorkerConfig {
        poll_timeout_seconds: 0,
        retry_base_delay: 0,
        stuck_ttl_seconds: 0,
        ..Default::default()
    });
    h.registry.register("t", || Arc::new(OkHandler))?;

    let id = h
        .dispatcher
        .dispatch(DispatchRequest::new("t", json!({})))
        .await?;

    // A worker claimed in both substrates, then died.
    assert_eq!(h.dispatch.dequeue("default", 0).await?, Some(id));
    assert!(h.store.claim_job(id, "dead:9").await?);

    // With a zero ttl both claims are already stale.
    let recovered = h.worker.recover_stale().await;
    assert_eq!(recovered, 2);

    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Pending);
    assert!(rec.available_at.is_none());

    assert!(h.worker.process_one().await?);
    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn idempotent_dispatch_reuses_the_active_job() -> Result<()> {
    let h = harness();
    h.registry.register("t", || Arc::new(OkHandler))?;

    let first = h
        .dispatcher
        .dispatch_idempotent("t", json!({"p": 1}), "R", None, None)
        .await?;
    assert!(first.created);

    // Same request id while the job is active: same id, payload ignored.
    let second = h
        .dispatcher
        .dispatch_idempotent("t", json!({"p": 2}), "R", None, None)
        .await?;
    assert_eq!(second.id, first.id);
    assert!(!second.created);

    let rec = h.store.find(first.id).await?.expect("record exists");
    assert_eq!(rec.payload, json!({"p": 1}));

    // Drain: only one token was enqueued.
    assert!(h.worker.process_one().await?);
    assert!(!h.worker.process_one().await?);

    // After the terminal transition the request id is free again.
    let third = h
        .dispatcher
        .dispatch_idempotent("t", json!({"p": 3}), "R", None, None)
        .await?;
    assert!(third.created);
    assert_ne!(third.id, first.id);
    Ok(())
}

#[tokio::test]
async fn delayed_nack_is_promoted_before_dequeue() -> Result<()> {
    let h = harness();
    h.registry.register("t", || Arc::new(OkHandler))?;

    let id = h
        .dispatcher
        .dispatch(DispatchRequest::new("t", json!({})))
        .await?;

    // Park the token for a second.
    assert_eq!(h.dispatch.dequeue("default", 0).await?, Some(id));
    h.dispatch.nack("default", id, 1).await?;
    assert_eq!(h.dispatch.dequeue("default", 0).await?, None);

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    // The next iteration promotes, dequeues, and completes it.
    assert!(h.worker.process_one().await?);
    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Completed);
    assert_eq!(h.dispatch.depths("default").await, (0, 0, 0));
    Ok(())
}

#[tokio::test]
async fn lost_claim_releases_the_token_without_touching_the_record() -> Result<()> {
    let h = harness();
    h.registry.register("t", || Arc::new(OkHandler))?;

    let id = h
        .dispatcher
        .dispatch(DispatchRequest::new("t", json!({})))
        .await?;

    // Another worker wins the record first.
    assert!(h.store.claim_job(id, "other:2").await?);

    assert!(h.worker.process_one().await?);

    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Running);
    assert_eq!(rec.locked_by.as_deref(), Some("other:2"));
    assert_eq!(h.dispatch.depths("default").await, (0, 0, 0));
    Ok(())
}

#[tokio::test]
async fn unknown_job_type_fails_through_the_normal_path() -> Result<()> {
    let h = harness();

    let id = h
        .dispatcher
        .dispatch(DispatchRequest {
            max_attempts: Some(1),
            ..DispatchRequest::new("nope", json!({}))
        })
        .await?;

    assert!(h.worker.process_one().await?);
    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Failed);
    assert_eq!(
        rec.error_message.as_deref(),
        Some("No handler registered for job type: nope")
    );
    Ok(())
}

#[tokio::test]
async fn handler_progress_lands_on_the_record() -> Result<()> {
    let h = harness();
    h.registry.register("t", || Arc::new(ReportsProgress))?;

    let id = h
        .dispatcher
        .dispatch(DispatchRequest::new("t", json!({})))
        .await?;

    assert!(h.worker.process_one().await?);
    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.status, JobStatus::Completed);
    assert_eq!(rec.progress, Some(100));
    assert_eq!(rec.progress_message.as_deref(), Some("halfway"));
    Ok(())
}

#[tokio::test]
async fn batch_dispatch_preserves_fifo_order() -> Result<()> {
    let h = harness();
    h.registry.register("t", || Arc::new(OkHandler))?;

    let ids = h
        .dispatcher
        .dispatch_batch(
            "t",
            vec![json!({"n": 1}), json!({"n": 2}), json!({"n": 3})],
            None,
            None,
        )
        .await?;
    assert_eq!(ids.len(), 3);

    for expected in &ids {
        assert_eq!(h.dispatch.dequeue("default", 0).await?, Some(*expected));
        h.dispatch.ack("default", *expected).await?;
    }
    Ok(())
}

#[tokio::test]
async fn worker_claims_under_its_own_id() -> Result<()> {
    let h = harness();

    let id = h
        .dispatcher
        .dispatch(DispatchRequest::new("t", json!({})))
        .await?;
    assert!(h.store.claim_job(id, h.worker.worker_id()).await?);

    let rec = h.store.find(id).await?.expect("record exists");
    assert_eq!(rec.locked_by.as_deref(), Some("test:1"));
    Ok(())
}

#[tokio::test]
async fn run_exits_on_stop() -> Result<()> {
    let h = harness();
    let worker = Arc::new(h.worker);

    let runner = worker.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    worker.stop();

    tokio::time::timeout(std::time::Duration::from_secs(2), handle)
        .await
        .expect("worker should stop promptly")?
        .expect("run returns cleanly");
    Ok(())
}

#[tokio::test]
async fn run_is_fatal_when_the_singleton_lock_is_held() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("worker.lock");
    let _held = SingletonLock::acquire(&path)?;

    let h = harness_with(WorkerConfig {
        poll_timeout_seconds: 0,
        lock_file: Some(path),
        ..Default::default()
    });

    assert!(h.worker.run().await.is_err());
    Ok(())
}
