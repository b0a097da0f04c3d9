//! End-to-end scenarios over the in-memory tiers.
//!
//! These drive the real coordinator, executor, retry machine, and worker
//! pool; only the storage seams are swapped for the in-memory doubles, whose
//! transition rules mirror the Postgres implementation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use conveyor::testing::InMemoryJobStore;
use conveyor::{
    Engine, EngineConfig, EngineError, Executor, HandlerRegistry, InMemoryFastQueue, JobStatus,
    JobStore, NewJob, QueueCoordinator, WorkerPool, WorkerPoolConfig,
};

struct Harness {
    store: Arc<InMemoryJobStore>,
    coordinator: Arc<QueueCoordinator>,
    executor: Arc<Executor>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

impl Harness {
    fn new(registry: HandlerRegistry, config: EngineConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryJobStore::new());
        let fast: Arc<dyn conveyor::FastQueue> = Arc::new(InMemoryFastQueue::new());
        let coordinator = Arc::new(QueueCoordinator::new(
            store.clone(),
            Some(fast.clone()),
            &config,
        ));
        let executor = Arc::new(Executor::new(
            store.clone(),
            Some(fast),
            Arc::new(registry),
            config.retry_policy(),
            config.job_timeout,
        ));
        Self {
            store,
            coordinator,
            executor,
        }
    }

    /// Claim-and-execute one job at a synthetic `now`, if any is eligible.
    async fn turn(&self, now: chrono::DateTime<Utc>) -> Option<uuid::Uuid> {
        let job = self.coordinator.next_job(now).await.unwrap()?;
        let id = job.id;
        self.executor.execute(job, CancellationToken::new()).await;
        Some(id)
    }

    fn pool(&self, max_workers: usize) -> WorkerPool {
        WorkerPool::new(
            self.coordinator.clone(),
            self.executor.clone(),
            WorkerPoolConfig {
                max_workers,
                poll_interval: Duration::from_millis(10),
                shutdown_grace: Duration::from_millis(500),
                pool_id: "test-pool".into(),
            },
        )
    }
}

fn noop_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("noop", |_, _| async move { Ok(serde_json::Value::Null) });
    registry
}

/// S1: higher priority dispatches first when both are eligible.
#[tokio::test]
async fn s1_priority_wins_among_eligible_jobs() {
    let harness = Harness::new(noop_registry(), EngineConfig::default());
    let now = Utc::now();

    let mut a = NewJob::immediate("a", "noop");
    a.priority = 5;
    a.scheduled_at = Some(now);
    let mut b = NewJob::immediate("b", "noop");
    b.priority = 10;
    b.scheduled_at = Some(now);

    let a = harness.coordinator.submit(a).await.unwrap();
    let b = harness.coordinator.submit(b).await.unwrap();

    let first = harness.coordinator.next_job(now).await.unwrap().unwrap();
    assert_eq!(first.id, b.id);
    let second = harness.coordinator.next_job(now).await.unwrap().unwrap();
    assert_eq!(second.id, a.id);
}

/// S2: a future job is invisible until its schedule arrives.
#[tokio::test]
async fn s2_scheduled_job_becomes_eligible_on_time() {
    let harness = Harness::new(noop_registry(), EngineConfig::default());
    let now = Utc::now();

    let mut new = NewJob::immediate("later", "noop");
    new.scheduled_at = Some(now + chrono::Duration::seconds(2));
    let job = harness.coordinator.submit(new).await.unwrap();

    assert!(harness
        .coordinator
        .next_job(now + chrono::Duration::seconds(1))
        .await
        .unwrap()
        .is_none());

    let claimed = harness
        .coordinator
        .next_job(now + chrono::Duration::seconds(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, job.id);
}

/// S3: flaky handler succeeds on the third attempt; backoff gaps grow.
#[tokio::test]
async fn s3_flaky_handler_retries_then_succeeds() {
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let mut registry = HandlerRegistry::new();
    registry.register_fn("flaky", move |_, _| {
        let calls = seen.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("transient outage")
            }
            Ok(serde_json::json!({"attempt": 3}))
        }
    });
    let harness = Harness::new(registry, EngineConfig::default());

    let start = Utc::now();
    let job = harness
        .coordinator
        .submit(NewJob::immediate("flaky job", "flaky"))
        .await
        .unwrap();

    // attempt 1 fails: eligible again no sooner than 2s out
    harness.turn(Utc::now()).await.unwrap();
    let after_first = harness.store.fetch(job.id).await.unwrap();
    assert_eq!(after_first.status, JobStatus::Retrying);
    assert!(after_first.scheduled_at >= start + chrono::Duration::seconds(2));

    // attempt 2 fails: backoff doubles
    let later = Utc::now() + chrono::Duration::hours(1);
    harness.turn(later).await.unwrap();
    let after_second = harness.store.fetch(job.id).await.unwrap();
    assert_eq!(after_second.status, JobStatus::Retrying);
    assert!(after_second.scheduled_at >= start + chrono::Duration::seconds(4));

    // attempt 3 succeeds
    let even_later = Utc::now() + chrono::Duration::hours(2);
    harness.turn(even_later).await.unwrap();
    let done = harness.store.fetch(job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

/// S4: an always-failing job walks pending -> running -> retrying (x2) ->
/// running -> failed, ending with attempts = max_retries + 1.
#[tokio::test]
async fn s4_exhausted_retries_end_terminally_failed() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("doomed", |_, _| async move { anyhow::bail!("always") });
    let harness = Harness::new(registry, EngineConfig::default());

    let mut new = NewJob::immediate("doomed job", "doomed");
    new.max_retries = Some(2);
    let job = harness.coordinator.submit(new).await.unwrap();
    assert_eq!(
        harness.store.fetch(job.id).await.unwrap().status,
        JobStatus::Pending
    );

    let mut now = Utc::now();
    for _ in 0..2 {
        harness.turn(now).await.unwrap();
        let retrying = harness.store.fetch(job.id).await.unwrap();
        assert_eq!(retrying.status, JobStatus::Retrying);
        now = Utc::now() + chrono::Duration::hours(24);
    }

    harness.turn(now).await.unwrap();
    let failed = harness.store.fetch(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 3);
    assert!(failed.completed_at.is_some());
}

/// S5: 50 bulk-submitted jobs across 10 workers with 100ms handlers all
/// succeed, in wall time bounded below by the serial floor and above by 5s.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn s5_bulk_load_drains_through_ten_workers() {
    let mut registry = HandlerRegistry::new();
    registry.register_fn("sleepy", |_, _| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(serde_json::Value::Null)
    });
    let harness = Harness::new(registry, EngineConfig::default());

    let batch: Vec<NewJob> = (0..50)
        .map(|i| NewJob::immediate(format!("bulk {i}"), "sleepy"))
        .collect();
    let inserted = harness.coordinator.submit_bulk(batch).await.unwrap();
    assert_eq!(inserted.len(), 50);

    let shutdown = CancellationToken::new();
    let started = std::time::Instant::now();
    let runner = tokio::spawn(harness.pool(10).run(shutdown.clone()));

    loop {
        let counts = harness.store.counts_by_status().await.unwrap();
        if counts.get(&JobStatus::Succeeded).copied().unwrap_or(0) == 50 {
            break;
        }
        assert!(started.elapsed() < Duration::from_secs(5), "drain too slow");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "drain faster than the serial floor");

    shutdown.cancel();
    runner.await.unwrap();
}

/// S6: cancel before any claim, then operator retry, then normal execution.
#[tokio::test]
async fn s6_cancelled_job_is_unclaimable_until_retried() {
    let registry = noop_registry();
    let store = Arc::new(InMemoryJobStore::new());
    let fast: Arc<dyn conveyor::FastQueue> = Arc::new(InMemoryFastQueue::new());
    let engine = Engine::new(
        EngineConfig::default(),
        store.clone(),
        Some(fast),
        registry,
    );

    let id = engine
        .submit(NewJob::immediate("victim", "noop"))
        .await
        .unwrap();
    let cancelled = engine.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // no claim path may see it
    let now = Utc::now();
    assert!(store.claim_one(now).await.unwrap().is_none());
    assert!(store.claim_one_by_id(id, now).await.unwrap().is_none());

    let retried = engine.retry(id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);

    let claimed = store.claim_one(Utc::now()).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, JobStatus::Running);
}

/// Exactly-once claim: N concurrent claimants over K eligible rows take the
/// K rows with no duplicates, and the rest see None.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_never_overlap() {
    let store = Arc::new(InMemoryJobStore::new());
    let now = Utc::now();
    let mut expected = Vec::new();
    for i in 0..8 {
        let job = NewJob::immediate(format!("row {i}"), "noop").into_job(now, 5);
        expected.push(store.insert(&job).await.unwrap().id);
    }

    let mut claims = JoinSet::new();
    for _ in 0..16 {
        let store = store.clone();
        claims.spawn(async move { store.claim_one(now).await.unwrap() });
    }

    let mut claimed = Vec::new();
    let mut misses = 0;
    while let Some(result) = claims.join_next().await {
        match result.unwrap() {
            Some(job) => claimed.push(job.id),
            None => misses += 1,
        }
    }

    claimed.sort();
    expected.sort();
    let mut deduped = claimed.clone();
    deduped.dedup();
    assert_eq!(deduped.len(), claimed.len(), "a job was claimed twice");
    assert_eq!(claimed, expected, "claims must cover exactly the eligible rows");
    assert_eq!(misses, 8);
}

/// Concurrent focused claims on one row: exactly one winner.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_claims_by_id_have_one_winner() {
    let store = Arc::new(InMemoryJobStore::new());
    let now = Utc::now();
    let job = NewJob::immediate("contested", "noop").into_job(now, 5);
    let id = store.insert(&job).await.unwrap().id;

    let mut claims = JoinSet::new();
    for _ in 0..16 {
        let store = store.clone();
        claims.spawn(async move { store.claim_one_by_id(id, now).await.unwrap() });
    }

    let mut winners = 0;
    while let Some(result) = claims.join_next().await {
        if result.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let final_state = store.fetch(id).await.unwrap();
    assert_eq!(final_state.attempts, 1);
}

/// Terminal states only move via the explicit retry command.
#[tokio::test]
async fn terminal_states_resist_other_transitions() {
    let harness = Harness::new(noop_registry(), EngineConfig::default());
    let now = Utc::now();

    let job = harness
        .coordinator
        .submit(NewJob::immediate("done", "noop"))
        .await
        .unwrap();
    harness.turn(now).await.unwrap();
    assert_eq!(
        harness.store.fetch(job.id).await.unwrap().status,
        JobStatus::Succeeded
    );

    // cancel and claim must both refuse a succeeded job
    assert!(matches!(
        harness.store.cancel(job.id, now).await,
        Err(EngineError::StateConflict { .. })
    ));
    assert!(harness.store.claim_one_by_id(job.id, now).await.unwrap().is_none());

    // and so must the operator retry, which is reserved for failed/cancelled
    assert!(matches!(
        harness.store.reset_for_retry(job.id, now).await,
        Err(EngineError::StateConflict { .. })
    ));
}

/// The engine keeps draining correctly when the fast tier is disabled.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_only_mode_still_drains() {
    let config = EngineConfig {
        use_fast_queue: false,
        ..Default::default()
    };
    let store = Arc::new(InMemoryJobStore::new());
    let coordinator = Arc::new(QueueCoordinator::new(store.clone(), None, &config));
    let executor = Arc::new(Executor::new(
        store.clone(),
        None,
        Arc::new(noop_registry()),
        config.retry_policy(),
        config.job_timeout,
    ));

    for i in 0..10 {
        coordinator
            .submit(NewJob::immediate(format!("job {i}"), "noop"))
            .await
            .unwrap();
    }

    let pool = WorkerPool::new(
        coordinator,
        executor,
        WorkerPoolConfig {
            max_workers: 4,
            poll_interval: Duration::from_millis(10),
            shutdown_grace: Duration::from_millis(200),
            pool_id: "store-only".into(),
        },
    );
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(pool.run(shutdown.clone()));

    for _ in 0..200 {
        let counts = store.counts_by_status().await.unwrap();
        if counts.get(&JobStatus::Succeeded).copied().unwrap_or(0) == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        store
            .counts_by_status()
            .await
            .unwrap()
            .get(&JobStatus::Succeeded)
            .copied()
            .unwrap_or(0),
        10
    );

    shutdown.cancel();
    runner.await.unwrap();
}
