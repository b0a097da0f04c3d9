//! # Conveyor
//!
//! An asynchronous job processing engine: accept work items, enqueue them
//! with priority and future scheduling, dispatch them atomically to a
//! bounded pool of concurrent workers, execute under per-job timeouts, and
//! retry failures with exponential backoff, without ever running the same
//! job on two workers, in one process or many.
//!
//! ## Architecture
//!
//! ```text
//! submit / submit_bulk
//!     │
//!     ▼
//! QueueCoordinator ──► JobStore (Postgres, source of truth)
//!     │                    ▲
//!     └─► FastQueue        │ claim (FOR UPDATE SKIP LOCKED)
//!         (advisory index) │
//!                          │
//! WorkerPool (N workers, semaphore-bounded)
//!     │
//!     ├─► QueueCoordinator.next_job()   pop fast tier, confirm durably
//!     │
//!     └─► Executor ──► Handler (opaque, per job_type)
//!             │
//!             ├─ success ──► complete: succeeded
//!             └─ failure ──► RetryPolicy ──► retrying (backoff) | failed
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Exactly-once claim** - the durable claim is linearizable; concurrent
//!    claimants receive distinct jobs.
//! 2. **Eligibility** - a claim never returns a job scheduled in the future.
//! 3. **Ordering** - among eligible jobs: priority desc, then earliest
//!    schedule, then lowest id.
//! 4. **Containment** - nothing a handler does (errors, panics, hangs)
//!    escapes the executor; only the outcome reaches the store.
//! 5. **Advisory fast tier** - tier B accelerates dispatch but every pop is
//!    revalidated against the store before execution.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fast_queue;
pub mod job;
pub mod registry;
pub mod retry;
pub mod stats;
pub mod store;
pub mod testing;
pub mod worker;

pub use config::EngineConfig;
pub use coordinator::QueueCoordinator;
pub use engine::{Engine, EngineHandle};
pub use error::{EngineError, Result};
pub use executor::Executor;
pub use fast_queue::{FastQueue, InMemoryFastQueue, RedisFastQueue};
pub use job::{CompletionOutcome, Job, JobFilter, JobStatus, NewJob};
pub use registry::{Handler, HandlerRegistry};
pub use retry::{RetryDecision, RetryPolicy};
pub use stats::{Introspection, QueueDepth, StatsSnapshot};
pub use store::{JobStore, PostgresJobStore};
pub use worker::{WorkerPool, WorkerPoolConfig};
