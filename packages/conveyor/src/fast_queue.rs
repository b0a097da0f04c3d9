//! Fast queue: the advisory priority index over ready jobs.
//!
//! Tier B accelerates the common dispatch path but is never the source of
//! truth. Every pop is revalidated by a focused durable claim; entries that
//! turn out stale (taken, cancelled, rescheduled) are silently discarded.
//!
//! Two implementations:
//! - [`InMemoryFastQueue`] for single-instance deployments and tests.
//! - [`RedisFastQueue`] for multi-instance deployments, one sorted set whose
//!   score encodes `(priority desc, scheduled_at asc)`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::error::Result;

/// Dominant term of the composite score. One priority step outweighs any
/// millisecond timestamp below this bound (~year 2286).
const PRIORITY_STRIDE: i64 = 10_i64.pow(13);

/// Composite sort key: lower score dispatches first. Priority descending is
/// the dominant term, `scheduled_at` ascending breaks ties.
pub fn encode_score(priority: i32, scheduled_at: DateTime<Utc>) -> i64 {
    -(priority as i64) * PRIORITY_STRIDE + scheduled_at.timestamp_millis()
}

/// Recover the `scheduled_at` milliseconds embedded in a score.
pub fn decode_scheduled_ms(score: i64) -> i64 {
    score.rem_euclid(PRIORITY_STRIDE)
}

/// Priority-ordered index of ready jobs.
#[async_trait]
pub trait FastQueue: Send + Sync {
    /// Insert or update the entry for `id`.
    async fn push(&self, id: Uuid, priority: i32, scheduled_at: DateTime<Utc>) -> Result<()>;

    /// Atomically remove and return the highest-priority id whose
    /// `scheduled_at <= now`, if any.
    async fn pop_ready(&self, now: DateTime<Utc>) -> Result<Option<Uuid>>;

    /// Drop the entry for `id` (used by cancel).
    async fn remove(&self, id: Uuid) -> Result<()>;

    async fn size(&self) -> Result<usize>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

#[derive(Default)]
struct MemoryIndex {
    // (score, id) -> id keeps entries unique per job while preserving order
    ordered: BTreeMap<(i64, Uuid), Uuid>,
    by_id: HashMap<Uuid, i64>,
}

/// Mutex-serialized ordered index. Pops walk from the front and skip entries
/// that are not yet due, so a future high-priority entry cannot starve a
/// ready lower-priority one.
#[derive(Default)]
pub struct InMemoryFastQueue {
    inner: Mutex<MemoryIndex>,
}

impl InMemoryFastQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryIndex> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl FastQueue for InMemoryFastQueue {
    async fn push(&self, id: Uuid, priority: i32, scheduled_at: DateTime<Utc>) -> Result<()> {
        let score = encode_score(priority, scheduled_at);
        let mut inner = self.lock();
        if let Some(old) = inner.by_id.insert(id, score) {
            inner.ordered.remove(&(old, id));
        }
        inner.ordered.insert((score, id), id);
        Ok(())
    }

    async fn pop_ready(&self, now: DateTime<Utc>) -> Result<Option<Uuid>> {
        let now_ms = now.timestamp_millis();
        let mut inner = self.lock();
        let key = inner
            .ordered
            .iter()
            .find(|((score, _), _)| decode_scheduled_ms(*score) <= now_ms)
            .map(|(key, _)| *key);
        if let Some(key) = key {
            inner.ordered.remove(&key);
            inner.by_id.remove(&key.1);
            return Ok(Some(key.1));
        }
        Ok(None)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        if let Some(score) = inner.by_id.remove(&id) {
            inner.ordered.remove(&(score, id));
        }
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.lock().by_id.len())
    }
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Shared ordered-set index backed by one Redis sorted set.
///
/// `pop_ready` is a Lua script so inspect-and-remove is one atomic round
/// trip. Only the head of the set is inspected: a not-yet-due head hides any
/// ready entries behind it, which is acceptable because the coordinator falls
/// through to a durable scan whenever the fast tier yields nothing.
pub struct RedisFastQueue {
    conn: ConnectionManager,
    key: String,
    pop_script: redis::Script,
}

const DEFAULT_KEY: &str = "queue:ready";

// head[2] is the score; scheduled_at lives in its euclidean remainder
const POP_READY_LUA: &str = r#"
local head = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if #head == 0 then
    return false
end
local sched = tonumber(head[2]) % 1e13
if sched <= tonumber(ARGV[1]) then
    redis.call('ZREM', KEYS[1], head[1])
    return head[1]
end
return false
"#;

impl RedisFastQueue {
    /// Connect with the default `queue:ready` key.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_key(url, DEFAULT_KEY).await
    }

    pub async fn connect_with_key(url: &str, key: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(crate::error::EngineError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(crate::error::EngineError::from)?;
        Ok(Self {
            conn,
            key: key.to_string(),
            pop_script: redis::Script::new(POP_READY_LUA),
        })
    }
}

#[async_trait]
impl FastQueue for RedisFastQueue {
    async fn push(&self, id: Uuid, priority: i32, scheduled_at: DateTime<Utc>) -> Result<()> {
        let score = encode_score(priority, scheduled_at);
        let mut conn = self.conn.clone();
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg(score)
            .arg(id.to_string())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_ready(&self, now: DateTime<Utc>) -> Result<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let popped: Option<String> = self
            .pop_script
            .key(&self.key)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        match popped {
            Some(raw) => Ok(Uuid::parse_str(&raw).ok()),
            None => Ok(None),
        }
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("ZREM")
            .arg(&self.key)
            .arg(id.to_string())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn size(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = redis::cmd("ZCARD")
            .arg(&self.key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
