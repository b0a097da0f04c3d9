//! Handler registry: maps `job_type` to an opaque executor.
//!
//! Handlers are registered once at startup by external code; the registry is
//! then shared immutably with the worker pool. The core never interprets
//! payloads, it only routes them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

/// One unit of opaque work. `payload` is handler-interpreted; `deadline` is
/// the wall-clock instant after which the executor abandons the attempt.
///
/// Return `Ok(result)` for success. Any `Err` becomes a failure outcome and
/// goes through the retry state machine; `anyhow` stays internal transport
/// and never crosses the engine's public API.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn run(
        &self,
        payload: serde_json::Value,
        deadline: DateTime<Utc>,
    ) -> anyhow::Result<serde_json::Value>;
}

type HandlerFn = Box<
    dyn Fn(serde_json::Value, DateTime<Utc>) -> BoxFuture<'static, anyhow::Result<serde_json::Value>>
        + Send
        + Sync,
>;

struct FnHandler {
    f: HandlerFn,
}

#[async_trait]
impl Handler for FnHandler {
    async fn run(
        &self,
        payload: serde_json::Value,
        deadline: DateTime<Utc>,
    ) -> anyhow::Result<serde_json::Value> {
        (self.f)(payload, deadline).await
    }
}

/// Registry of handlers keyed by `job_type`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `job_type`.
    ///
    /// # Panics
    ///
    /// Panics if a handler is already registered for this type. Registration
    /// happens once at startup; a duplicate is a wiring bug.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn Handler>) {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            panic!("handler already registered for job type: {}", job_type);
        }
        self.handlers.insert(job_type, handler);
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F)
    where
        F: Fn(serde_json::Value, DateTime<Utc>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let handler = FnHandler {
            f: Box::new(move |payload, deadline| Box::pin(f(payload, deadline))),
        };
        self.register(job_type, Arc::new(handler));
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn has(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("registered_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
