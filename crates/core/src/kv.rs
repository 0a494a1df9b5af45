//! Key-value store trait: the shared substrate behind stop flags, token
//! buckets, queues and context mirrors.
//!
//! The surface is a deliberately small Redis-like subset. Implementations:
//! in-memory (tests, single process), no-op (always unavailable).

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Minimal key-value primitives with TTL support.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// The backend name (e.g. "memory", "none").
    fn name(&self) -> &str;

    /// Round-trip check.
    async fn ping(&self) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a string value, replacing whatever was there. `ttl = None` keeps
    /// the key until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete keys; returns how many existed.
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    /// Atomically add `delta` to an integer value (missing keys count as 0).
    async fn incr(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Set a TTL on an existing key; false when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Add a member to a sorted set; true when newly inserted.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool>;

    /// Remove sorted-set members with `min <= score <= max`.
    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Incrementally iterate keys matching a glob pattern. A returned cursor
    /// of 0 ends the iteration.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<(u64, Vec<String>)>;

    /// Push onto the head of a list; returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Remove every occurrence of `value` from a list; returns how many were
    /// removed.
    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Pop from the tail of a list, waiting up to `timeout` for an element.
    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>>;

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    /// Sliding-window admission as one atomic step: drop entries older than
    /// `now_ms - window`, admit when fewer than `limit` remain (recording
    /// `now_ms`), and refresh the key TTL to `window`.
    async fn sliding_window_acquire(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
        now_ms: i64,
    ) -> StoreResult<bool>;
}

/// Collect every key matching `pattern`, scanning in pages of `page_size`.
pub async fn scan_all(store: &dyn KvStore, pattern: &str, page_size: usize) -> StoreResult<Vec<String>> {
    let mut cursor = 0;
    let mut keys = Vec::new();
    loop {
        let (next, page) = store.scan(cursor, pattern, page_size).await?;
        keys.extend(page);
        if next == 0 {
            return Ok(keys);
        }
        cursor = next;
    }
}
