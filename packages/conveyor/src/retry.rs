//! Retry/backoff state machine.
//!
//! After a failed execution the policy decides between another attempt and a
//! terminal `failed` state. Delays grow exponentially in the attempt count
//! and are clamped to a ceiling; optional jitter spreads retry storms.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Disposition of a failed execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue, eligible again at `at`.
    Retry { at: DateTime<Utc> },
    /// Retry budget exhausted; the job becomes `failed`.
    Terminal,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base of the exponential: delay = `backoff_base ^ attempts` seconds.
    pub backoff_base: f64,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Apply +/-10% jitter to computed delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_base: 2.0,
            max_delay: Duration::from_secs(3600),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Decide the disposition for a job whose `attempts` counter has already
    /// been incremented by the claim.
    pub fn decide(&self, attempts: i32, max_retries: i32, now: DateTime<Utc>) -> RetryDecision {
        if attempts > max_retries {
            return RetryDecision::Terminal;
        }
        let mut delay = self.delay_for(attempts);
        if self.jitter {
            let factor = 0.9 + fastrand::f64() * 0.2;
            delay = delay.mul_f64(factor);
        }
        // scheduled_at must strictly increase on every retry
        let delay = delay.max(Duration::from_millis(1));
        RetryDecision::Retry {
            at: now + chrono::Duration::milliseconds(delay.as_millis() as i64),
        }
    }

    /// Pre-jitter delay for the given attempt count, clamped to `max_delay`.
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let secs = self.backoff_base.powi(attempts.max(0));
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}
