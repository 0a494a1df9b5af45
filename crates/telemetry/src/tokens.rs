//! Per-session token accounting in minute buckets.
//!
//! Counters live at `loomi:tokens:{u}:{s}:YYYYMMDDHHMM`, each refreshed to a
//! 24 hour TTL on every increment. Every operation is fire-and-forget: store
//! failures are logged once and otherwise ignored, since token counts are
//! advisory for the billing summary.

use chrono::{DateTime, Utc};
use loomi_core::kv::scan_all;
use loomi_store::{DegradeLog, PoolClass, PoolManager, glob_escape};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// USD per token used for the billing summary.
pub const DEFAULT_COST_PER_TOKEN: f64 = 0.000002;

const SCAN_PAGE: usize = 1000;

/// Rolled-up usage for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSummary {
    pub total_tokens: i64,
    pub cost: f64,
}

/// Rough token estimate for a streamed fragment: a quarter of its character
/// count, never less than one.
pub fn estimate_tokens(chunk: &str) -> i64 {
    (chunk.chars().count() / 4).max(1) as i64
}

/// Bucket key for the minute containing `at`.
pub fn bucket_key(user_id: &str, session_id: &str, at: DateTime<Utc>) -> String {
    format!("loomi:tokens:{user_id}:{session_id}:{}", at.format("%Y%m%d%H%M"))
}

/// `SCAN` pattern for every minute bucket of one session. Ids are escaped
/// and the suffix is pinned to twelve digits, so neither wildcards nor
/// colons in an id reach another session's buckets.
fn bucket_pattern(user_id: &str, session_id: &str) -> String {
    format!(
        "loomi:tokens:{}:{}:{}",
        glob_escape(user_id),
        glob_escape(session_id),
        "[0-9]".repeat(12)
    )
}

pub struct TokenAccumulator {
    pools: Arc<PoolManager>,
    bucket_ttl: Duration,
    cost_per_token: f64,
    degraded: DegradeLog,
}

impl TokenAccumulator {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            bucket_ttl: Duration::from_secs(24 * 60 * 60),
            cost_per_token: DEFAULT_COST_PER_TOKEN,
            degraded: DegradeLog::new("token_accumulator"),
        }
    }

    pub fn with_bucket_ttl(mut self, ttl: Duration) -> Self {
        self.bucket_ttl = ttl;
        self
    }

    pub fn with_cost_per_token(mut self, cost: f64) -> Self {
        self.cost_per_token = cost;
        self
    }

    pub fn cost_per_token(&self) -> f64 {
        self.cost_per_token
    }

    /// Touch the current bucket so a session with no output still has a key.
    pub async fn initialize(&self, user_id: &str, session_id: &str) {
        self.add(user_id, session_id, 0).await;
    }

    /// Add `tokens` to the current-minute bucket.
    pub async fn add(&self, user_id: &str, session_id: &str, tokens: i64) {
        self.add_at(user_id, session_id, tokens, Utc::now()).await;
    }

    /// Add `tokens` to the bucket for the minute containing `at`.
    pub async fn add_at(&self, user_id: &str, session_id: &str, tokens: i64, at: DateTime<Utc>) {
        let client = match self.pools.acquire(PoolClass::Normal).await {
            Ok(client) => client,
            Err(e) => return self.degraded.report("add", &e),
        };

        let key = bucket_key(user_id, session_id, at);
        if let Err(e) = client.incr(&key, tokens).await {
            return self.degraded.report("incr", &e);
        }
        if let Err(e) = client.expire(&key, self.bucket_ttl).await {
            self.degraded.report("expire", &e);
        }
    }

    /// Sum every bucket of the session and price it.
    pub async fn summary(&self, user_id: &str, session_id: &str) -> TokenSummary {
        let total = match self.total(user_id, session_id).await {
            Ok(total) => total,
            Err(e) => {
                self.degraded.report("summary", &e);
                0
            }
        };

        TokenSummary {
            total_tokens: total,
            cost: total as f64 * self.cost_per_token,
        }
    }

    async fn total(&self, user_id: &str, session_id: &str) -> Result<i64, loomi_core::StoreError> {
        let client = self.pools.acquire(PoolClass::Normal).await?;
        let keys = scan_all(&*client, &bucket_pattern(user_id, session_id), SCAN_PAGE).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut total: i64 = 0;
        for chunk in keys.chunks(SCAN_PAGE) {
            let values = client.mget(chunk).await?;
            for value in values.into_iter().flatten() {
                match value.parse::<i64>() {
                    Ok(n) => total = total.saturating_add(n),
                    Err(_) => debug!(value = %value, "Skipping non-integer token bucket"),
                }
            }
        }
        Ok(total)
    }

    /// Delete every bucket of the session.
    pub async fn cleanup(&self, user_id: &str, session_id: &str) {
        let result = async {
            let client = self.pools.acquire(PoolClass::Normal).await?;
            let keys = scan_all(&*client, &bucket_pattern(user_id, session_id), SCAN_PAGE).await?;
            let mut removed = 0;
            for batch in keys.chunks(SCAN_PAGE) {
                removed += client.del(batch).await?;
            }
            Ok::<u64, loomi_core::StoreError>(removed)
        }
        .await;

        match result {
            Ok(removed) => debug!(user_id, session_id, removed, "Token buckets cleaned up"),
            Err(e) => self.degraded.report("cleanup", &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use loomi_store::{InMemoryKv, NoopKv};

    fn accumulator() -> (Arc<InMemoryKv>, TokenAccumulator) {
        let kv = Arc::new(InMemoryKv::new());
        let pools = Arc::new(PoolManager::with_defaults(kv.clone()));
        (kv, TokenAccumulator::new(pools))
    }

    #[test]
    fn estimate_counts_chars_not_bytes() {
        assert_eq!(estimate_tokens("ab"), 1);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        // Counted per character, so multi-byte text is not overestimated
        assert_eq!(estimate_tokens("小红书帖子内容"), 1);
        assert_eq!(estimate_tokens("小红书帖子内容啊"), 2);
    }

    #[test]
    fn bucket_key_is_minute_granular() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 59).unwrap();
        assert_eq!(bucket_key("u", "s", at), "loomi:tokens:u:s:202403090705");
    }

    #[tokio::test]
    async fn summary_sums_across_buckets() {
        let (_kv, tokens) = accumulator();
        let t0 = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 9, 7, 6, 0).unwrap();

        tokens.add_at("u1", "s1", 10, t0).await;
        tokens.add_at("u1", "s1", 15, t0).await;
        tokens.add_at("u1", "s1", 5, t1).await;
        tokens.add_at("u1", "other", 100, t1).await;

        let summary = tokens.summary("u1", "s1").await;
        assert_eq!(summary.total_tokens, 30);
        assert!((summary.cost - 30.0 * DEFAULT_COST_PER_TOKEN).abs() < 1e-12);
    }

    #[tokio::test]
    async fn buckets_carry_ttl() {
        let (kv, tokens) = accumulator();
        tokens.add("u1", "s1", 3).await;
        let keys = scan_all(kv.as_ref(), "loomi:tokens:u1:s1:*", 10).await.unwrap();
        assert_eq!(keys.len(), 1);
        let ttl = kv.ttl(&keys[0]).await.unwrap();
        assert!(ttl > Duration::from_secs(23 * 60 * 60));
    }

    #[tokio::test]
    async fn cleanup_removes_all_buckets() {
        let (_kv, tokens) = accumulator();
        tokens.initialize("u1", "s1").await;
        tokens.add("u1", "s1", 42).await;
        assert_eq!(tokens.summary("u1", "s1").await.total_tokens, 42);

        tokens.cleanup("u1", "s1").await;
        assert_eq!(tokens.summary("u1", "s1").await.total_tokens, 0);
    }

    #[tokio::test]
    async fn wildcard_ids_stay_inside_their_session() {
        let (_kv, tokens) = accumulator();
        tokens.add("alice", "s1", 500).await;
        tokens.add("bob", "s9", 700).await;
        tokens.add("alice", "s1:x", 11).await;

        assert_eq!(tokens.summary("*", "*").await.total_tokens, 0);
        assert_eq!(tokens.summary("alice", "s?").await.total_tokens, 0);
        assert_eq!(tokens.summary("[ab]lice", "s1").await.total_tokens, 0);
        assert_eq!(tokens.summary("alice", "s1").await.total_tokens, 500);

        tokens.cleanup("*", "*").await;
        assert_eq!(tokens.summary("alice", "s1").await.total_tokens, 500);
        assert_eq!(tokens.summary("bob", "s9").await.total_tokens, 700);

        tokens.add("*", "*", 3).await;
        assert_eq!(tokens.summary("*", "*").await.total_tokens, 3);
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_zero() {
        let pools = Arc::new(PoolManager::with_defaults(Arc::new(NoopKv)));
        let tokens = TokenAccumulator::new(pools);
        tokens.add("u1", "s1", 5).await;
        let summary = tokens.summary("u1", "s1").await;
        assert_eq!(summary, TokenSummary::default());
        tokens.cleanup("u1", "s1").await;
    }
}
