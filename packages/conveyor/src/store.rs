//! Durable job store: the authoritative tier.
//!
//! The claim is the engine's only hard serialization point. In Postgres it is
//! a `FOR UPDATE SKIP LOCKED` select-and-update, so K concurrent claimants
//! take K distinct rows without blocking one another.
//!
//! # Claim ordering
//!
//! Among rows satisfying `status IN ('pending','retrying') AND
//! scheduled_at <= now`, the winner is the row with the highest `priority`,
//! ties broken by earliest `scheduled_at`, then lowest `id`. The
//! `(status, priority DESC, scheduled_at ASC)` index covers this scan.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::job::{CompletionOutcome, Job, JobFilter, JobStatus};
use crate::retry::RetryDecision;

/// Hard cap on rows per `insert_many` call.
pub const BULK_INSERT_CAP: usize = 100;

/// Persistence seam for the engine. `PostgresJobStore` is the production
/// implementation; `testing::InMemoryJobStore` backs unit and property tests.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist one prepared row (status `pending`).
    async fn insert(&self, job: &Job) -> Result<Job>;

    /// Atomic batch insert, all-or-nothing, at most [`BULK_INSERT_CAP`] rows.
    async fn insert_many(&self, jobs: &[Job]) -> Result<Vec<Job>>;

    async fn fetch(&self, id: Uuid) -> Result<Job>;

    /// Filtered listing ordered by `created_at` desc.
    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>>;

    /// Atomically claim the single best eligible row: transition to
    /// `running`, set `started_at = now`, increment `attempts`. Concurrent
    /// callers never receive the same row.
    async fn claim_one(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Focused claim after a fast-queue pop. `None` when the row is no
    /// longer eligible (taken, cancelled, or rescheduled into the future).
    async fn claim_one_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Record an execution outcome for a `running` row.
    async fn complete(&self, id: Uuid, outcome: CompletionOutcome, now: DateTime<Utc>)
        -> Result<()>;

    /// `pending|retrying` -> `cancelled`. `StateConflict` in any other state.
    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job>;

    /// Operator retry: `failed|cancelled` -> `pending`, error cleared,
    /// `scheduled_at = now`, `attempts` unchanged.
    async fn reset_for_retry(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job>;

    /// Eligible rows for fast-tier republication, claim-ordered.
    async fn list_ready(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>>;

    /// Move `running` rows whose `started_at < cutoff` back to `retrying`
    /// with `scheduled_at = now`. Recovers claims lost to dead workers.
    async fn recover_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    async fn counts_by_status(&self) -> Result<HashMap<JobStatus, i64>>;

    /// Durable-ready depth: eligible rows at `now`.
    async fn ready_count(&self, now: DateTime<Utc>) -> Result<i64>;
}

// ============================================================================
// Postgres implementation
// ============================================================================

const JOB_COLUMNS: &str = "id, name, job_type, priority, payload, status, attempts, max_retries, \
     scheduled_at, created_at, started_at, completed_at, result, error, owner_id";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a dedicated pool.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_row<'e, E>(executor: E, job: &Job) -> Result<Job>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let inserted = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO jobs (
                id, name, job_type, priority, payload, status, attempts, max_retries,
                scheduled_at, created_at, started_at, completed_at, result, error, owner_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING id, name, job_type, priority, payload, status, attempts, max_retries,
                      scheduled_at, created_at, started_at, completed_at, result, error, owner_id
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.job_type)
        .bind(job.priority)
        .bind(&job.payload)
        .bind(job.status)
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.scheduled_at)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.result)
        .bind(&job.error)
        .bind(job.owner_id)
        .fetch_one(executor)
        .await?;

        Ok(inserted)
    }

    /// Distinguish `NotFound` from `StateConflict` after a guarded update
    /// matched zero rows.
    async fn conflict_for(&self, id: Uuid, op: &'static str) -> EngineError {
        match self.fetch(id).await {
            Ok(job) => EngineError::StateConflict {
                id,
                status: job.status,
                op,
            },
            Err(err) => err,
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: &Job) -> Result<Job> {
        Self::insert_row(&self.pool, job).await
    }

    async fn insert_many(&self, jobs: &[Job]) -> Result<Vec<Job>> {
        if jobs.len() > BULK_INSERT_CAP {
            return Err(EngineError::Validation(format!(
                "bulk insert exceeds {} jobs",
                BULK_INSERT_CAP
            )));
        }
        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(jobs.len());
        for job in jobs {
            inserted.push(Self::insert_row(&mut *tx, job).await?);
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn fetch(&self, id: Uuid) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        job.ok_or(EngineError::NotFound(id))
    }

    async fn list(&self, filter: &JobFilter, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::job_status IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.status)
        .bind(filter.job_type.as_deref())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn claim_one(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH candidate AS (
                SELECT id
                FROM jobs
                WHERE status IN ('pending', 'retrying')
                  AND scheduled_at <= $1
                ORDER BY priority DESC, scheduled_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'running',
                started_at = $1,
                attempts = attempts + 1
            WHERE id IN (SELECT id FROM candidate)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn claim_one_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>> {
        // A single guarded UPDATE is linearizable on its own: of two
        // concurrent callers, exactly one matches the eligible row.
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = $2,
                attempts = attempts + 1
            WHERE id = $1
              AND status IN ('pending', 'retrying')
              AND scheduled_at <= $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn complete(
        &self,
        id: Uuid,
        outcome: CompletionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let updated = match outcome {
            CompletionOutcome::Success { result } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'succeeded', result = $2, completed_at = $3, error = NULL
                    WHERE id = $1 AND status = 'running'
                    "#,
                )
                .bind(id)
                .bind(result)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            CompletionOutcome::Failure {
                error,
                next: RetryDecision::Terminal,
            } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'failed', error = $2, completed_at = $3
                    WHERE id = $1 AND status = 'running'
                    "#,
                )
                .bind(id)
                .bind(error)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            CompletionOutcome::Failure {
                error,
                next: RetryDecision::Retry { at },
            } => {
                // completed_at stays null: the job is not done
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'retrying', error = $2, scheduled_at = $3
                    WHERE id = $1 AND status = 'running'
                    "#,
                )
                .bind(id)
                .bind(error)
                .bind(at)
                .execute(&self.pool)
                .await?
            }
        };

        if updated.rows_affected() == 0 {
            return Err(self.conflict_for(id, "complete").await);
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'cancelled', completed_at = $2
            WHERE id = $1 AND status IN ('pending', 'retrying')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.conflict_for(id, "cancel").await),
        }
    }

    async fn reset_for_retry(&self, id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'pending', error = NULL, result = NULL,
                completed_at = NULL, scheduled_at = $2
            WHERE id = $1 AND status IN ('failed', 'cancelled')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match job {
            Some(job) => Ok(job),
            None => Err(self.conflict_for(id, "retry").await),
        }
    }

    async fn list_ready(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status IN ('pending', 'retrying')
              AND scheduled_at <= $1
            ORDER BY priority DESC, scheduled_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE jobs
            SET status = 'retrying', scheduled_at = $2
            WHERE status = 'running' AND started_at < $1
            RETURNING id
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn counts_by_status(&self) -> Result<HashMap<JobStatus, i64>> {
        let rows = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    async fn ready_count(&self, now: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM jobs
            WHERE status IN ('pending', 'retrying') AND scheduled_at <= $1
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
