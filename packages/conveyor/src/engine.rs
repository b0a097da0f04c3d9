//! Engine facade: one instance per process.
//!
//! Wires the durable store, fast queue, handler registry, coordinator,
//! executor, and worker pool from a single `EngineConfig`, and exposes the
//! narrow submission/operator API the external HTTP layer consumes.
//!
//! # Lifecycle
//!
//! ```ignore
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("email:send", |payload, _deadline| async move {
//!     // ... deliver ...
//!     Ok(serde_json::json!({"delivered": true}))
//! });
//!
//! let store = Arc::new(PostgresJobStore::connect(&database_url).await?);
//! store.migrate().await?;
//!
//! let engine = Engine::new(EngineConfig::default(), store, None, registry);
//! let handle = engine.start();
//!
//! let id = engine.submit(NewJob::immediate("welcome", "email:send")).await?;
//!
//! // on termination: drain workers, stop the reclaim loop, drop handles
//! handle.shutdown().await;
//! ```

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::coordinator::QueueCoordinator;
use crate::error::{EngineError, Result};
use crate::executor::Executor;
use crate::fast_queue::FastQueue;
use crate::job::{Job, JobFilter, NewJob};
use crate::registry::HandlerRegistry;
use crate::stats::{Introspection, StatsSnapshot};
use crate::worker::{WorkerPool, WorkerPoolConfig};

pub struct Engine {
    config: EngineConfig,
    coordinator: Arc<QueueCoordinator>,
    executor: Arc<Executor>,
    registry: Arc<HandlerRegistry>,
    introspection: Introspection,
}

impl Engine {
    /// Assemble an engine. When `config.use_fast_queue` is false the fast
    /// tier is dropped entirely and workers scan the store.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn crate::store::JobStore>,
        fast: Option<Arc<dyn FastQueue>>,
        registry: HandlerRegistry,
    ) -> Self {
        let fast = if config.use_fast_queue { fast } else { None };
        let registry = Arc::new(registry);
        let coordinator = Arc::new(QueueCoordinator::new(store.clone(), fast.clone(), &config));
        let executor = Arc::new(Executor::new(
            store.clone(),
            fast.clone(),
            registry.clone(),
            config.retry_policy(),
            config.job_timeout,
        ));
        let introspection = Introspection::new(store, fast);
        Self {
            config,
            coordinator,
            executor,
            registry,
            introspection,
        }
    }

    /// Launch the worker pool and the reclaim loop.
    pub fn start(&self) -> EngineHandle {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::new(
            self.coordinator.clone(),
            self.executor.clone(),
            WorkerPoolConfig {
                max_workers: self.config.max_workers,
                poll_interval: self.config.poll_interval,
                shutdown_grace: self.config.shutdown_grace,
                ..Default::default()
            },
        );
        let pool_task = tokio::spawn(pool.run(shutdown.clone()));
        let reclaim_task = self
            .coordinator
            .clone()
            .spawn_reclaim_loop(shutdown.clone());
        EngineHandle {
            shutdown,
            pool_task,
            reclaim_task,
        }
    }

    // ========================================================================
    // Submission API
    // ========================================================================

    /// Validate and enqueue one job.
    pub async fn submit(&self, new: NewJob) -> Result<Uuid> {
        self.check_job_type(&new)?;
        let job = self.coordinator.submit(new).await?;
        Ok(job.id)
    }

    /// Validate and enqueue up to `bulk_submit_cap` jobs atomically.
    pub async fn submit_bulk(&self, batch: Vec<NewJob>) -> Result<Vec<Uuid>> {
        for new in &batch {
            self.check_job_type(new)?;
        }
        let jobs = self.coordinator.submit_bulk(batch).await?;
        Ok(jobs.into_iter().map(|job| job.id).collect())
    }

    /// Cancel a `pending`/`retrying` job. Running jobs cannot be cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        let job = self.coordinator.store().cancel(id, Utc::now()).await?;
        if let Some(fast) = self.coordinator.fast() {
            // best-effort: a leftover entry is discarded at claim time anyway
            if let Err(err) = fast.remove(id).await {
                tracing::warn!(job_id = %id, error = %err, "fast queue remove failed");
            }
        }
        Ok(job)
    }

    /// Operator retry: put a `failed`/`cancelled` job back in line.
    pub async fn retry(&self, id: Uuid) -> Result<Job> {
        let job = self.coordinator.store().reset_for_retry(id, Utc::now()).await?;
        if let Some(fast) = self.coordinator.fast() {
            if let Err(err) = fast.push(job.id, job.priority, job.scheduled_at).await {
                tracing::warn!(job_id = %job.id, error = %err, "fast queue push failed");
            }
        }
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        self.coordinator.store().fetch(id).await
    }

    pub async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>> {
        self.coordinator.store().list(filter, limit, offset).await
    }

    pub async fn stats(&self) -> Result<StatsSnapshot> {
        self.introspection.snapshot(Utc::now()).await
    }

    pub fn introspection(&self) -> &Introspection {
        &self.introspection
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The registry is fixed at startup, so an unknown type is a caller
    /// mistake surfaced synchronously instead of a job that dies at claim
    /// time.
    fn check_job_type(&self, new: &NewJob) -> Result<()> {
        if self.registry.has(&new.job_type) {
            Ok(())
        } else {
            Err(EngineError::Validation(format!(
                "unknown job type: {}",
                new.job_type
            )))
        }
    }
}

/// Running background tasks of an engine. Dropping the handle without
/// calling [`shutdown`](EngineHandle::shutdown) detaches them.
pub struct EngineHandle {
    shutdown: CancellationToken,
    pool_task: JoinHandle<()>,
    reclaim_task: JoinHandle<()>,
}

impl EngineHandle {
    /// Token observed by every background task; cancel it to begin shutdown
    /// without waiting for the drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Graceful teardown: stop claiming, drain in-flight work (workers first,
    /// then the reclaim loop), interrupting whatever outlives the grace
    /// period.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.pool_task.await;
        let _ = self.reclaim_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_queue::InMemoryFastQueue;
    use crate::job::JobStatus;
    use crate::testing::InMemoryJobStore;

    fn engine_with_noop() -> (Arc<InMemoryJobStore>, Engine) {
        let store = Arc::new(InMemoryJobStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register_fn("noop", |_, _| async move { Ok(serde_json::Value::Null) });
        let engine = Engine::new(
            EngineConfig::default(),
            store.clone(),
            Some(Arc::new(InMemoryFastQueue::new())),
            registry,
        );
        (store, engine)
    }

    #[tokio::test]
    async fn submit_rejects_unknown_job_type() {
        let (_, engine) = engine_with_noop();
        let err = engine
            .submit(NewJob::immediate("job", "ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn submit_get_roundtrip() {
        let (_, engine) = engine_with_noop();
        let id = engine
            .submit(NewJob::immediate("job", "noop"))
            .await
            .unwrap();
        let job = engine.get(id).await.unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn bulk_rejects_any_unknown_type_before_insert() {
        let (store, engine) = engine_with_noop();
        let batch = vec![
            NewJob::immediate("ok", "noop"),
            NewJob::immediate("bad", "ghost"),
        ];
        assert!(engine.submit_bulk(batch).await.is_err());
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn cancel_then_retry_restores_pending() {
        let (_, engine) = engine_with_noop();
        let id = engine
            .submit(NewJob::immediate("job", "noop"))
            .await
            .unwrap();

        let cancelled = engine.cancel(id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let retried = engine.retry(id).await.unwrap();
        assert_eq!(retried.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn stats_snapshot_counts_submissions() {
        let (_, engine) = engine_with_noop();
        for i in 0..4 {
            engine
                .submit(NewJob::immediate(format!("job {i}"), "noop"))
                .await
                .unwrap();
        }
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.counts[&JobStatus::Pending], 4);
        assert_eq!(stats.depth.fast, 4);
        assert_eq!(stats.depth.durable_ready, 4);
    }

    #[tokio::test]
    async fn disabled_fast_queue_is_dropped() {
        let store = Arc::new(InMemoryJobStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register_fn("noop", |_, _| async move { Ok(serde_json::Value::Null) });
        let config = EngineConfig {
            use_fast_queue: false,
            ..Default::default()
        };
        let engine = Engine::new(
            config,
            store,
            Some(Arc::new(InMemoryFastQueue::new())),
            registry,
        );

        engine
            .submit(NewJob::immediate("job", "noop"))
            .await
            .unwrap();
        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.depth.fast, 0);
        assert_eq!(stats.depth.durable_ready, 1);
    }
}
