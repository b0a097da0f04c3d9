//! Operator introspection: status counts, paginated listings, queue depth.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::error::Result;
use crate::fast_queue::FastQueue;
use crate::job::{Job, JobFilter, JobStatus};
use crate::store::JobStore;

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 500;

/// Snapshot of both tiers' backlogs. Not transactional: the two numbers are
/// read independently and may disagree briefly.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueDepth {
    pub fast: usize,
    pub durable_ready: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub counts: HashMap<JobStatus, i64>,
    pub depth: QueueDepth,
}

#[derive(Clone)]
pub struct Introspection {
    store: Arc<dyn JobStore>,
    fast: Option<Arc<dyn FastQueue>>,
}

impl Introspection {
    pub fn new(store: Arc<dyn JobStore>, fast: Option<Arc<dyn FastQueue>>) -> Self {
        Self { store, fast }
    }

    /// Aggregate counts, zero-filled so every status is always present.
    pub async fn counts_by_status(&self) -> Result<HashMap<JobStatus, i64>> {
        let mut counts: HashMap<JobStatus, i64> =
            JobStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for (status, count) in self.store.counts_by_status().await? {
            counts.insert(status, count);
        }
        Ok(counts)
    }

    /// Paginated listing, newest first. `page` is 1-based; `per_page`
    /// defaults to [`DEFAULT_PAGE_SIZE`] and is clamped to [`MAX_PAGE_SIZE`].
    pub async fn list(
        &self,
        filter: &JobFilter,
        page: i64,
        per_page: Option<i64>,
    ) -> Result<Vec<Job>> {
        let per_page = per_page.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let page = page.max(1);
        let offset = (page - 1) * per_page;
        self.store.list(filter, per_page, offset).await
    }

    pub async fn queue_depth(&self, now: DateTime<Utc>) -> Result<QueueDepth> {
        let fast = match &self.fast {
            Some(fast) => match fast.size().await {
                Ok(size) => size,
                Err(err) => {
                    warn!(error = %err, "fast queue size check failed");
                    0
                }
            },
            None => 0,
        };
        let durable_ready = self.store.ready_count(now).await?;
        Ok(QueueDepth {
            fast,
            durable_ready,
        })
    }

    pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<StatsSnapshot> {
        Ok(StatsSnapshot {
            counts: self.counts_by_status().await?,
            depth: self.queue_depth(now).await?,
        })
    }
}
