//! Worker pool: N concurrent pullers over the coordinator.
//!
//! Each worker loops claim -> execute -> repeat, sleeping `poll_interval`
//! when nothing is ready. A pool-wide semaphore bounds in-flight executions
//! at `max_workers`; workers coordinate only through the shared claim
//! protocol, never with each other.
//!
//! # Shutdown protocol
//!
//! Cancelling the shutdown token stops new claims immediately. In-flight
//! jobs get `shutdown_grace` to finish; after that their child tokens are
//! cancelled and the executor records each interrupted job as a retry, so it
//! resumes after restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::coordinator::QueueCoordinator;
use crate::executor::Executor;

/// Store-error backoff doubles from the poll interval up to this ceiling.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Pool size N; also the semaphore bound on in-flight executions.
    pub max_workers: usize,
    /// Idle-poll cadence.
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs before interrupting them.
    pub shutdown_grace: Duration,
    /// Identifies this pool instance in logs.
    pub pool_id: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
            pool_id: format!("pool-{}", Uuid::new_v4()),
        }
    }
}

pub struct WorkerPool {
    coordinator: Arc<QueueCoordinator>,
    executor: Arc<Executor>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        coordinator: Arc<QueueCoordinator>,
        executor: Arc<Executor>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            coordinator,
            executor,
            config,
        }
    }

    /// Run the pool until `shutdown` is cancelled, then drain.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            pool_id = %self.config.pool_id,
            max_workers = self.config.max_workers,
            "worker pool starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        // cancelled only after the grace period; interrupts in-flight jobs
        let jobs_token = CancellationToken::new();

        let watchdog = {
            let shutdown = shutdown.clone();
            let jobs_token = jobs_token.clone();
            let grace = self.config.shutdown_grace;
            tokio::spawn(async move {
                shutdown.cancelled().await;
                tokio::time::sleep(grace).await;
                jobs_token.cancel();
            })
        };

        let mut workers = JoinSet::new();
        for worker in 0..self.config.max_workers {
            workers.spawn(worker_loop(
                worker,
                self.coordinator.clone(),
                self.executor.clone(),
                semaphore.clone(),
                self.config.poll_interval,
                shutdown.clone(),
                jobs_token.clone(),
            ));
        }

        while workers.join_next().await.is_some() {}
        watchdog.abort();

        info!(pool_id = %self.config.pool_id, "worker pool stopped");
    }
}

async fn worker_loop(
    worker: usize,
    coordinator: Arc<QueueCoordinator>,
    executor: Arc<Executor>,
    semaphore: Arc<Semaphore>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    jobs_token: CancellationToken,
) {
    let mut error_backoff = poll_interval;

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => break, // semaphore closed, pool is gone
        };

        match coordinator.next_job(Utc::now()).await {
            Ok(Some(job)) => {
                error_backoff = poll_interval;
                debug!(worker, job_id = %job.id, job_type = %job.job_type, "executing job");
                executor.execute(job, jobs_token.child_token()).await;
                drop(permit);
            }
            Ok(None) => {
                drop(permit);
                error_backoff = poll_interval;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(err) if err.is_transient() => {
                drop(permit);
                error!(worker, error = %err, "failed to claim next job, backing off");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(error_backoff) => {}
                }
                error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
            }
            Err(err) => {
                drop(permit);
                // not a load problem, so no escalating backoff; keep polling
                // at the normal cadence and make noise
                error!(worker, error = %err, "unexpected claim error");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    debug!(worker, "worker stopped");
}
