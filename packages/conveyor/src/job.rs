//! Job model for background work execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::error::EngineError;
use crate::retry::RetryDecision;

/// Maximum length of a job's human-readable name.
pub const MAX_NAME_LEN: usize = 200;

/// Inclusive priority bounds. Higher priority dispatches earlier.
pub const PRIORITY_MIN: i32 = -1000;
/// See [`PRIORITY_MIN`].
pub const PRIORITY_MAX: i32 = 1000;

/// Maximum serialized payload size accepted at submission (256 KiB).
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Retrying,
}

impl JobStatus {
    /// All statuses, in declaration order. Used to zero-fill status counts.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Retrying,
    ];

    /// Terminal states only transition further via an explicit retry command.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a job in this status can be claimed once its schedule arrives.
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// A persisted job row. The durable store is the source of truth for every
/// field; in-process copies are snapshots.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    // Identity
    pub name: String,
    pub job_type: String,

    // Dispatch ordering
    pub priority: i32,

    // Handler-interpreted; the core treats this as opaque
    pub payload: serde_json::Value,

    // State
    pub status: JobStatus,
    pub attempts: i32,
    pub max_retries: i32,

    // Scheduling
    pub scheduled_at: DateTime<Utc>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    // Outcome
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,

    // Submitter, stored opaquely
    pub owner_id: Option<Uuid>,
}

impl Job {
    /// Whether the job is eligible for claiming at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.scheduled_at <= now
    }
}

// ============================================================================
// Submission
// ============================================================================

/// A job submission, validated before it reaches either queue tier.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewJob {
    pub name: String,
    pub job_type: String,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,
    /// Per-job override; falls back to the engine default when `None`.
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i32>,
    /// Eligibility time; `None` means immediately eligible.
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub owner_id: Option<Uuid>,
}

impl NewJob {
    /// Convenience constructor for an immediately-eligible job.
    pub fn immediate(name: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self::builder().name(name.into()).job_type(job_type.into()).build()
    }

    /// Check submission constraints. Violations surface synchronously to the
    /// caller and never reach the queue.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.is_empty() {
            return Err(EngineError::Validation("name must not be empty".into()));
        }
        if self.name.chars().count() > MAX_NAME_LEN {
            return Err(EngineError::Validation(format!(
                "name exceeds {} characters",
                MAX_NAME_LEN
            )));
        }
        if self.job_type.is_empty() {
            return Err(EngineError::Validation("job_type must not be empty".into()));
        }
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&self.priority) {
            return Err(EngineError::Validation(format!(
                "priority {} outside [{}, {}]",
                self.priority, PRIORITY_MIN, PRIORITY_MAX
            )));
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries < 0 {
                return Err(EngineError::Validation("max_retries must be >= 0".into()));
            }
        }
        let payload_len = serde_json::to_vec(&self.payload)
            .map(|b| b.len())
            .unwrap_or(usize::MAX);
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(EngineError::Validation(format!(
                "payload exceeds {} bytes",
                MAX_PAYLOAD_BYTES
            )));
        }
        Ok(())
    }

    /// Materialize the row the durable store will persist. Ids are UUIDv7 so
    /// the lowest-id tiebreak in the claim ordering tracks submission order.
    pub fn into_job(self, now: DateTime<Utc>, default_max_retries: i32) -> Job {
        Job {
            id: Uuid::now_v7(),
            name: self.name,
            job_type: self.job_type,
            priority: self.priority,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            scheduled_at: self.scheduled_at.unwrap_or(now),
            created_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            owner_id: self.owner_id,
        }
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Terminal fields written by the store when an execution finishes.
#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    /// Handler produced a result; the job becomes `succeeded`.
    Success { result: serde_json::Value },
    /// Handler failed; `next` decides between `failed` and `retrying`.
    Failure { error: String, next: RetryDecision },
}

/// Filter for listings and counts. `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
}

impl JobFilter {
    pub fn by_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(job_type) = &self.job_type {
            if &job.job_type != job_type {
                return false;
            }
        }
        true
    }
}
