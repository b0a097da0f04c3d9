//! Test doubles for the storage seams.
//!
//! `InMemoryJobStore` mirrors the Postgres semantics closely enough to drive
//! the coordinator, executor, and worker pool in tests without a database.
//! Claims are serialized by a single mutex, which makes them linearizable by
//! construction: the property suites exercise real concurrency against it.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::job::{CompletionOutcome, Job, JobFilter, JobStatus};
use crate::retry::RetryDecision;
use crate::store::{JobStore, BULK_INSERT_CAP};

/// Mutex-serialized store with Postgres-equivalent transition rules.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of every row, unordered. Test-assertion helper.
    pub fn all(&self) -> Vec<Job> {
        self.lock().values().cloned().collect()
    }

    fn claim_in_place(job: &mut Job, now: DateTime<Utc>) -> Job {
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.attempts += 1;
        job.clone()
    }

    /// The claim ordering: highest priority, then earliest schedule, then
    /// lowest id.
    fn claim_key(job: &Job) -> (Reverse<i32>, DateTime<Utc>, Uuid) {
        (Reverse(job.priority), job.scheduled_at, job.id)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<Job> {
        let mut jobs = self.lock();
        if jobs.contains_key(&job.id) {
            return Err(EngineError::Validation(format!(
                "duplicate job id {}",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(job.clone())
    }

    async fn insert_many(&self, batch: &[Job]) -> Result<Vec<Job>> {
        let mut jobs = self.lock();
        // validate the whole batch before touching the map: all-or-nothing
        if batch.len() > BULK_INSERT_CAP {
            return Err(EngineError::Validation(format!(
                "bulk insert exceeds {} jobs",
                BULK_INSERT_CAP
            )));
        }
        for job in batch {
            if jobs.contains_key(&job.id) {
                return Err(EngineError::Validation(format!(
                    "duplicate job id {}",
                    job.id
                )));
            }
        }
        for job in batch {
            jobs.insert(job.id, job.clone());
        }
        Ok(batch.to_vec())
    }

    async fn fetch(&self, id: Uuid) -> Result<Job> {
        self.lock().get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let mut matched: Vec<Job> = self
            .lock()
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn claim_one(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut jobs = self.lock();
        let winner = jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .min_by_key(|job| Self::claim_key(job))
            .map(|job| job.id);
        Ok(winner.map(|id| {
            let job = jobs.get_mut(&id).expect("winner exists under lock");
            Self::claim_in_place(job, now)
        }))
    }

    async fn claim_one_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut jobs = self.lock();
        match jobs.get_mut(&id) {
            Some(job) if job.is_eligible(now) => Ok(Some(Self::claim_in_place(job, now))),
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        id: Uuid,
        outcome: CompletionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Err(EngineError::StateConflict {
                id,
                status: job.status,
                op: "complete",
            });
        }
        match outcome {
            CompletionOutcome::Success { result } => {
                job.status = JobStatus::Succeeded;
                job.result = Some(result);
                job.error = None;
                job.completed_at = Some(now);
            }
            CompletionOutcome::Failure {
                error,
                next: RetryDecision::Terminal,
            } => {
                job.status = JobStatus::Failed;
                job.error = Some(error);
                job.completed_at = Some(now);
            }
            CompletionOutcome::Failure {
                error,
                next: RetryDecision::Retry { at },
            } => {
                job.status = JobStatus::Retrying;
                job.error = Some(error);
                job.scheduled_at = at;
            }
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        if !job.status.is_claimable() {
            return Err(EngineError::StateConflict {
                id,
                status: job.status,
                op: "cancel",
            });
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        Ok(job.clone())
    }

    async fn reset_for_retry(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(EngineError::StateConflict {
                id,
                status: job.status,
                op: "retry",
            });
        }
        job.status = JobStatus::Pending;
        job.error = None;
        job.result = None;
        job.completed_at = None;
        job.scheduled_at = now;
        Ok(job.clone())
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let mut ready: Vec<Job> = self
            .lock()
            .values()
            .filter(|job| job.is_eligible(now))
            .cloned()
            .collect();
        ready.sort_by_key(Self::claim_key);
        ready.truncate(limit.max(0) as usize);
        Ok(ready)
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut jobs = self.lock();
        let mut recovered = Vec::new();
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running
                && job.started_at.is_some_and(|started| started < cutoff)
            {
                job.status = JobStatus::Retrying;
                job.scheduled_at = now;
                recovered.push(job.id);
            }
        }
        Ok(recovered)
    }

    async fn counts_by_status(&self) -> Result<HashMap<JobStatus, i64>> {
        let mut counts = HashMap::new();
        for job in self.lock().values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn ready_count(&self, now: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .lock()
            .values()
            .filter(|job| job.is_eligible(now))
            .count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NewJob;

    fn job(priority: i32, scheduled_at: DateTime<Utc>) -> Job {
        let mut new = NewJob::immediate("test job", "noop");
        new.priority = priority;
        new.scheduled_at = Some(scheduled_at);
        new.into_job(Utc::now(), 5)
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_schedule_then_id() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let earlier = now - chrono::Duration::seconds(10);

        let low = store.insert(&job(1, now)).await.unwrap();
        let high_late = store.insert(&job(5, now)).await.unwrap();
        let high_early = store.insert(&job(5, earlier)).await.unwrap();

        let first = store.claim_one(now).await.unwrap().unwrap();
        assert_eq!(first.id, high_early.id);
        let second = store.claim_one(now).await.unwrap().unwrap();
        assert_eq!(second.id, high_late.id);
        let third = store.claim_one(now).await.unwrap().unwrap();
        assert_eq!(third.id, low.id);
        assert!(store.claim_one(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_ignores_future_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store
            .insert(&job(10, now + chrono::Duration::seconds(5)))
            .await
            .unwrap();
        assert!(store.claim_one(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_increments_attempts_and_sets_started_at() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(&job(0, now)).await.unwrap();

        let claimed = store.claim_one(now).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.started_at, Some(now));
    }

    #[tokio::test]
    async fn bulk_insert_is_all_or_nothing() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let duplicate = job(0, now);
        let batch = vec![job(0, now), duplicate.clone(), duplicate];

        assert!(store.insert_many(&batch).await.is_err());
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn bulk_insert_rejects_oversized_batch() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let batch: Vec<Job> = (0..BULK_INSERT_CAP + 1).map(|_| job(0, now)).collect();

        assert!(store.insert_many(&batch).await.is_err());
        assert!(store.all().is_empty());
    }

    #[tokio::test]
    async fn cancel_running_is_a_conflict() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let inserted = store.insert(&job(0, now)).await.unwrap();
        store.claim_one(now).await.unwrap().unwrap();

        let err = store.cancel(inserted.id, now).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));
    }

    #[tokio::test]
    async fn reset_for_retry_requires_terminal_failure() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let inserted = store.insert(&job(0, now)).await.unwrap();

        // pending -> retry command is a conflict
        let err = store.reset_for_retry(inserted.id, now).await.unwrap_err();
        assert!(matches!(err, EngineError::StateConflict { .. }));

        store.claim_one(now).await.unwrap().unwrap();
        store
            .complete(
                inserted.id,
                CompletionOutcome::Failure {
                    error: "boom".into(),
                    next: RetryDecision::Terminal,
                },
                now,
            )
            .await
            .unwrap();

        let reset = store.reset_for_retry(inserted.id, now).await.unwrap();
        assert_eq!(reset.status, JobStatus::Pending);
        assert!(reset.error.is_none());
        assert!(reset.completed_at.is_none());
        assert_eq!(reset.attempts, 1);
    }

    #[tokio::test]
    async fn recover_stale_requeues_old_running_jobs() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let started = now - chrono::Duration::seconds(600);
        let inserted = store.insert(&job(0, started)).await.unwrap();
        store.claim_one_by_id(inserted.id, started).await.unwrap().unwrap();

        let recovered = store
            .recover_stale(now - chrono::Duration::seconds(330), now)
            .await
            .unwrap();
        assert_eq!(recovered, vec![inserted.id]);

        let job = store.fetch(inserted.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.scheduled_at, now);
    }
}
