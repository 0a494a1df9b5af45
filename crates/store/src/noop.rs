//! No-op key-value backend: every call fails as unavailable.
//!
//! Components built on the store degrade gracefully, so this backend runs
//! the whole runtime with no stop flags, token buckets, or context mirrors.

use async_trait::async_trait;
use loomi_core::error::StoreError;
use loomi_core::kv::{KvStore, StoreResult};
use std::time::Duration;

/// A key-value backend that stores nothing.
pub struct NoopKv;

fn unavailable<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("store backend disabled".into()))
}

#[async_trait]
impl KvStore for NoopKv {
    fn name(&self) -> &str { "none" }

    async fn ping(&self) -> StoreResult<()> {
        unavailable()
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        unavailable()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
        unavailable()
    }

    async fn del(&self, _keys: &[String]) -> StoreResult<u64> {
        unavailable()
    }

    async fn incr(&self, _key: &str, _delta: i64) -> StoreResult<i64> {
        unavailable()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StoreResult<bool> {
        unavailable()
    }

    async fn zadd(&self, _key: &str, _score: f64, _member: &str) -> StoreResult<bool> {
        unavailable()
    }

    async fn zrem_range_by_score(&self, _key: &str, _min: f64, _max: f64) -> StoreResult<u64> {
        unavailable()
    }

    async fn zcard(&self, _key: &str) -> StoreResult<u64> {
        unavailable()
    }

    async fn scan(&self, _cursor: u64, _pattern: &str, _count: usize) -> StoreResult<(u64, Vec<String>)> {
        unavailable()
    }

    async fn lrem(&self, _key: &str, _value: &str) -> StoreResult<u64> {
        unavailable()
    }

    async fn lpush(&self, _key: &str, _value: &str) -> StoreResult<u64> {
        unavailable()
    }

    async fn brpop(&self, _key: &str, _timeout: Duration) -> StoreResult<Option<String>> {
        unavailable()
    }

    async fn mget(&self, _keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        unavailable()
    }

    async fn sliding_window_acquire(
        &self,
        _key: &str,
        _window: Duration,
        _limit: u64,
        _now_ms: i64,
    ) -> StoreResult<bool> {
        unavailable()
    }
}
