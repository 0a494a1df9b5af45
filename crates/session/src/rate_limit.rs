//! Sliding-window budget on subagent fan-out per user.

use chrono::Utc;
use loomi_store::{DegradeLog, PoolClass, PoolManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub fn rate_limit_key(user_id: &str) -> String {
    format!("loomi:ratelimit:subagents:{user_id}")
}

/// Admits at most `limit` subagent launches per user within `window`.
/// Fails open: a store error admits the launch.
pub struct SubagentRateLimiter {
    pools: Arc<PoolManager>,
    limit: u64,
    window: Duration,
    degraded: DegradeLog,
}

impl SubagentRateLimiter {
    pub fn new(pools: Arc<PoolManager>, limit: u64, window: Duration) -> Self {
        Self {
            pools,
            limit,
            window,
            degraded: DegradeLog::new("rate_limiter"),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn try_acquire(&self, user_id: &str) -> bool {
        self.try_acquire_at(user_id, Utc::now().timestamp_millis()).await
    }

    pub async fn try_acquire_at(&self, user_id: &str, now_ms: i64) -> bool {
        let result = match self.pools.acquire(PoolClass::Normal).await {
            Ok(client) => {
                client
                    .sliding_window_acquire(&rate_limit_key(user_id), self.window, self.limit, now_ms)
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(admitted) => {
                if !admitted {
                    debug!(user_id, limit = self.limit, "Subagent launch over budget");
                }
                admitted
            }
            Err(e) => {
                self.degraded.report("try_acquire", &e);
                true
            }
        }
    }
}
