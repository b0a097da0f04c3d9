//! Queue coordinator: owns enqueue and dequeue flow across both tiers.
//!
//! Submissions land in the durable store first; the fast-tier push is
//! best-effort. Dequeue prefers the fast tier but revalidates every pop with
//! a focused durable claim, so a stale index entry can never double-dispatch
//! a job. A periodic reclaim task heals fast-tier drift (evictions, restarts,
//! failed pushes) and recovers claims orphaned by dead workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fast_queue::FastQueue;
use crate::job::{Job, NewJob};
use crate::store::JobStore;

/// How many stale fast-tier pops to chase before falling back to the scan.
const POP_CLAIM_TRIES: usize = 3;

/// Rows republished to the fast tier per reclaim pass.
const RECLAIM_BATCH: i64 = 500;

pub struct QueueCoordinator {
    store: Arc<dyn JobStore>,
    fast: Option<Arc<dyn FastQueue>>,
    default_max_retries: i32,
    bulk_submit_cap: usize,
    reclaim_interval: Duration,
    /// Running jobs older than `job_timeout + shutdown_grace` have lost
    /// their worker and are requeued by the reclaim pass.
    stale_after: Duration,
}

impl QueueCoordinator {
    pub fn new(
        store: Arc<dyn JobStore>,
        fast: Option<Arc<dyn FastQueue>>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            fast,
            default_max_retries: config.max_retries,
            bulk_submit_cap: config.bulk_submit_cap,
            reclaim_interval: config.reclaim_interval,
            stale_after: config.job_timeout + config.shutdown_grace,
        }
    }

    /// Validate and persist one submission, then index it for dispatch.
    pub async fn submit(&self, new: NewJob) -> Result<Job> {
        new.validate()?;
        let job = new.into_job(Utc::now(), self.default_max_retries);
        let inserted = self.store.insert(&job).await?;
        self.push_fast(&inserted).await;
        Ok(inserted)
    }

    /// Atomic bulk submission: either every job is persisted or none is.
    pub async fn submit_bulk(&self, batch: Vec<NewJob>) -> Result<Vec<Job>> {
        if batch.len() > self.bulk_submit_cap {
            return Err(EngineError::Validation(format!(
                "bulk submission exceeds {} jobs",
                self.bulk_submit_cap
            )));
        }
        for new in &batch {
            new.validate()?;
        }
        let now = Utc::now();
        let jobs: Vec<Job> = batch
            .into_iter()
            .map(|new| new.into_job(now, self.default_max_retries))
            .collect();
        let inserted = self.store.insert_many(&jobs).await?;
        for job in &inserted {
            self.push_fast(job).await;
        }
        Ok(inserted)
    }

    /// Claim the next eligible job, or `None` when nothing is ready.
    ///
    /// Fast-tier pops are advisory: each one is confirmed against the store,
    /// and entries that lost their eligibility in the meantime are discarded.
    /// At most one claim succeeds per job, whichever path found it.
    pub async fn next_job(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        if let Some(fast) = &self.fast {
            for _ in 0..POP_CLAIM_TRIES {
                let popped = match fast.pop_ready(now).await {
                    Ok(popped) => popped,
                    Err(err) => {
                        warn!(error = %err, "fast queue unavailable, falling back to store scan");
                        break;
                    }
                };
                let Some(id) = popped else { break };
                if let Some(job) = self.store.claim_one_by_id(id, now).await? {
                    return Ok(Some(job));
                }
                // already taken, cancelled, or rescheduled; drop and retry
                debug!(job_id = %id, "discarded stale fast-queue entry");
            }
        }
        self.store.claim_one(now).await
    }

    /// One reclaim pass: requeue orphaned `running` rows, then republish
    /// eligible rows to the fast tier. Returns how many were republished.
    pub async fn reclaim_scan(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::milliseconds(self.stale_after.as_millis() as i64);
        let recovered = self.store.recover_stale(cutoff, now).await?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered stale running jobs");
        }

        let Some(fast) = &self.fast else {
            return Ok(0);
        };
        let ready = self.store.list_ready(now, RECLAIM_BATCH).await?;
        let mut republished = 0;
        for job in &ready {
            match fast.push(job.id, job.priority, job.scheduled_at).await {
                Ok(()) => republished += 1,
                Err(err) => {
                    warn!(error = %err, "fast queue republish failed");
                    break;
                }
            }
        }
        if republished > 0 {
            debug!(count = republished, "republished ready jobs to fast queue");
        }
        Ok(republished)
    }

    /// Periodic reclaim task; ticks until the token is cancelled.
    pub fn spawn_reclaim_loop(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = self.reclaim_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick heals restarts
            loop {
                if let Err(err) = self.reclaim_scan(Utc::now()).await {
                    warn!(error = %err, "reclaim scan failed");
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }
            info!("reclaim loop stopped");
        })
    }

    async fn push_fast(&self, job: &Job) {
        if let Some(fast) = &self.fast {
            if let Err(err) = fast.push(job.id, job.priority, job.scheduled_at).await {
                // submission already succeeded durably; the reclaim pass
                // republishes whatever the fast tier dropped
                warn!(job_id = %job.id, error = %err, "fast queue push failed");
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn fast(&self) -> Option<&Arc<dyn FastQueue>> {
        self.fast.as_ref()
    }
}
