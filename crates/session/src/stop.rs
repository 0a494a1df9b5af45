//! Cooperative per-session cancellation flags.
//!
//! A session is *stopping* while `loomi:stop:{u}:{s}` holds `"1"`. The key
//! carries a short TTL so a stop from a crashed client heals itself.

use loomi_core::error::{Error, Result};
use loomi_store::{DegradeLog, PoolClass, PoolManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_STOP_TTL: Duration = Duration::from_secs(30);

pub fn stop_key(user_id: &str, session_id: &str) -> String {
    format!("loomi:stop:{user_id}:{session_id}")
}

pub struct StopManager {
    pools: Arc<PoolManager>,
    ttl: Duration,
    degraded: DegradeLog,
}

impl StopManager {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            ttl: DEFAULT_STOP_TTL,
            degraded: DegradeLog::new("stop_manager"),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Flag the session as stopping. Returns whether the flag was written.
    pub async fn request_stop(&self, user_id: &str, session_id: &str) -> bool {
        let client = match self.pools.acquire(PoolClass::HighPriority).await {
            Ok(client) => client,
            Err(e) => {
                self.degraded.report("request_stop", &e);
                return false;
            }
        };
        match client.set(&stop_key(user_id, session_id), "1", Some(self.ttl)).await {
            Ok(()) => {
                info!(user_id, session_id, "Stop requested");
                true
            }
            Err(e) => {
                self.degraded.report("request_stop", &e);
                false
            }
        }
    }

    /// Whether the session is stopping. Reports `false` when the store
    /// cannot answer.
    pub async fn is_stopped(&self, user_id: &str, session_id: &str) -> bool {
        let client = match self.pools.acquire(PoolClass::HighPriority).await {
            Ok(client) => client,
            Err(e) => {
                self.degraded.report("is_stopped", &e);
                return false;
            }
        };
        match client.get(&stop_key(user_id, session_id)).await {
            Ok(value) => value.as_deref() == Some("1"),
            Err(e) => {
                self.degraded.report("is_stopped", &e);
                false
            }
        }
    }

    /// `Err(Error::Stopped)` when the session is stopping.
    pub async fn check(&self, user_id: &str, session_id: &str) -> Result<()> {
        if self.is_stopped(user_id, session_id).await {
            return Err(Error::stopped(user_id, session_id));
        }
        Ok(())
    }

    pub async fn clear(&self, user_id: &str, session_id: &str) {
        let result = match self.pools.acquire(PoolClass::HighPriority).await {
            Ok(client) => client.del(&[stop_key(user_id, session_id)]).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.degraded.report("clear", &e);
        }
    }
}
