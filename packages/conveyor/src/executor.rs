//! Executor: runs one claimed job and records the outcome.
//!
//! Nothing a handler does may escape into the worker loop. Handlers run in
//! their own task so a panic is caught as a `JoinError`; timeouts and
//! shutdown interruption abort the task. Whatever happens, the only thing
//! that propagates is a completion written to the durable store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::fast_queue::FastQueue;
use crate::job::{CompletionOutcome, Job};
use crate::registry::HandlerRegistry;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::JobStore;

/// Failure reasons are capped before persisting.
const MAX_ERROR_LEN: usize = 1000;

enum Attempt {
    Success(serde_json::Value),
    Failed(String),
    Interrupted,
}

pub struct Executor {
    store: Arc<dyn JobStore>,
    fast: Option<Arc<dyn FastQueue>>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        fast: Option<Arc<dyn FastQueue>>,
        registry: Arc<HandlerRegistry>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            fast,
            registry,
            retry,
            timeout,
        }
    }

    /// Execute one claimed job to completion. Infallible from the caller's
    /// perspective: store write failures are logged, never raised, so a bad
    /// job can never take down its worker.
    pub async fn execute(&self, job: Job, cancel: CancellationToken) {
        let job_id = job.id;
        let job_type = job.job_type.clone();

        let handler = match self.registry.get(&job.job_type) {
            Some(handler) => handler,
            None => {
                // Terminal regardless of remaining retry budget: no amount
                // of retrying produces a handler.
                warn!(job_id = %job_id, job_type = %job_type, "unknown job type");
                self.record(
                    &job,
                    CompletionOutcome::Failure {
                        error: format!("unknown job type: {}", job_type),
                        next: RetryDecision::Terminal,
                    },
                )
                .await;
                return;
            }
        };

        let deadline = Utc::now() + chrono::Duration::milliseconds(self.timeout.as_millis() as i64);
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { handler.run(payload, deadline).await });

        let attempt = tokio::select! {
            joined = &mut task => match joined {
                Ok(Ok(result)) => Attempt::Success(result),
                Ok(Err(err)) => Attempt::Failed(truncate_error(format!("{:#}", err))),
                Err(join_err) => Attempt::Failed(truncate_error(format!(
                    "handler panicked: {}",
                    join_err
                ))),
            },
            _ = tokio::time::sleep(self.timeout) => {
                task.abort();
                Attempt::Failed(format!("timeout after {}s", self.timeout.as_secs()))
            }
            _ = cancel.cancelled() => {
                task.abort();
                Attempt::Interrupted
            }
        };

        match attempt {
            Attempt::Success(result) => {
                debug!(job_id = %job_id, job_type = %job_type, "job succeeded");
                self.record(&job, CompletionOutcome::Success { result }).await;
            }
            Attempt::Failed(reason) => {
                warn!(job_id = %job_id, job_type = %job_type, error = %reason, "job failed");
                let decision = self.retry.decide(job.attempts, job.max_retries, Utc::now());
                self.record(
                    &job,
                    CompletionOutcome::Failure {
                        error: reason,
                        next: decision,
                    },
                )
                .await;
            }
            Attempt::Interrupted => {
                // Shutdown interruptions resume after restart; they still go
                // through the retry budget.
                info!(job_id = %job_id, job_type = %job_type, "job interrupted by shutdown");
                let decision = self.retry.decide(job.attempts, job.max_retries, Utc::now());
                self.record(
                    &job,
                    CompletionOutcome::Failure {
                        error: "interrupted by shutdown".to_string(),
                        next: decision,
                    },
                )
                .await;
            }
        }
    }

    async fn record(&self, job: &Job, outcome: CompletionOutcome) {
        let republish = match &outcome {
            CompletionOutcome::Failure {
                next: RetryDecision::Retry { at },
                ..
            } => Some(*at),
            _ => None,
        };

        if let Err(err) = self.store.complete(job.id, outcome, Utc::now()).await {
            error!(job_id = %job.id, error = %err, "failed to record job outcome");
            return;
        }

        // A retried job re-enters the fast tier under its new schedule.
        if let (Some(at), Some(fast)) = (republish, &self.fast) {
            if let Err(err) = fast.push(job.id, job.priority, at).await {
                warn!(job_id = %job.id, error = %err, "fast queue republish failed");
            }
        }
    }
}

fn truncate_error(reason: String) -> String {
    if reason.chars().count() <= MAX_ERROR_LEN {
        return reason;
    }
    reason.chars().take(MAX_ERROR_LEN).collect()
}
