//! Engine configuration.
//!
//! One `EngineConfig` is built at startup and threaded by reference to every
//! component. Defaults match production expectations; `from_env` applies
//! `CONVEYOR_*` overrides for deployments that configure through the
//! environment (pair with `dotenvy` in the binary, not here).

use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size N. Concurrency is bounded by a pool-wide semaphore.
    pub max_workers: usize,
    /// Default retry cap for jobs that do not override it.
    pub max_retries: i32,
    /// Base of the exponential retry delay, `base ^ attempts` seconds.
    pub retry_backoff_base: f64,
    /// Retry delays are clamped to this ceiling.
    pub retry_max_delay: Duration,
    /// Apply +/-10% jitter to retry delays.
    pub retry_jitter: bool,
    /// Per-execution deadline.
    pub job_timeout: Duration,
    /// Idle-poll cadence when no job is ready.
    pub poll_interval: Duration,
    /// When false, tier B is skipped entirely and workers scan the store.
    pub use_fast_queue: bool,
    /// Maximum jobs per bulk submission.
    pub bulk_submit_cap: usize,
    /// Cadence of the reclaim task (fast-tier republish + stale recovery).
    pub reclaim_interval: Duration,
    /// How long shutdown waits for in-flight jobs before interrupting them.
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            max_retries: 5,
            retry_backoff_base: 2.0,
            retry_max_delay: Duration::from_secs(3600),
            retry_jitter: false,
            job_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            use_fast_queue: true,
            bulk_submit_cap: 100,
            reclaim_interval: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Defaults with `CONVEYOR_*` environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = parse_env::<usize>("CONVEYOR_MAX_WORKERS")? {
            config.max_workers = v;
        }
        if let Some(v) = parse_env::<i32>("CONVEYOR_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = parse_env::<f64>("CONVEYOR_RETRY_BACKOFF_BASE")? {
            config.retry_backoff_base = v;
        }
        if let Some(v) = parse_env::<f64>("CONVEYOR_JOB_TIMEOUT_SECONDS")? {
            config.job_timeout = seconds("CONVEYOR_JOB_TIMEOUT_SECONDS", v)?;
        }
        if let Some(v) = parse_env::<f64>("CONVEYOR_POLL_INTERVAL_SECONDS")? {
            config.poll_interval = seconds("CONVEYOR_POLL_INTERVAL_SECONDS", v)?;
        }
        if let Some(v) = parse_env::<bool>("CONVEYOR_USE_FAST_QUEUE")? {
            config.use_fast_queue = v;
        }
        if let Some(v) = parse_env::<f64>("CONVEYOR_SHUTDOWN_GRACE_SECONDS")? {
            config.shutdown_grace = seconds("CONVEYOR_SHUTDOWN_GRACE_SECONDS", v)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(EngineError::Validation("max_workers must be >= 1".into()));
        }
        if self.max_retries < 0 {
            return Err(EngineError::Validation("max_retries must be >= 0".into()));
        }
        if self.retry_backoff_base <= 0.0 {
            return Err(EngineError::Validation(
                "retry_backoff_base must be positive".into(),
            ));
        }
        if self.bulk_submit_cap == 0 {
            return Err(EngineError::Validation("bulk_submit_cap must be >= 1".into()));
        }
        Ok(())
    }

    /// The retry policy this configuration describes.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_base: self.retry_backoff_base,
            max_delay: self.retry_max_delay,
            jitter: self.retry_jitter,
        }
    }
}

fn seconds(key: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(EngineError::Validation(format!(
            "{} must be a non-negative number of seconds",
            key
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| EngineError::Validation(format!("invalid value for {}: {}", key, raw))),
        Err(_) => Ok(None),
    }
}
