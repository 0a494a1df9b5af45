//! Client liveness timestamps, written by the `/heartbeat` endpoint.

use chrono::{DateTime, Utc};
use loomi_store::{DegradeLog, PoolClass, PoolManager};
use std::sync::Arc;
use std::time::Duration;

pub const HEARTBEAT_TTL: Duration = Duration::from_secs(5 * 60);

pub fn heartbeat_key(user_id: &str, session_id: &str) -> String {
    format!("loomi:heartbeat:{user_id}:{session_id}")
}

pub struct HeartbeatTracker {
    pools: Arc<PoolManager>,
    degraded: DegradeLog,
}

impl HeartbeatTracker {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            degraded: DegradeLog::new("heartbeat"),
        }
    }

    /// Record a beat at `now`. Returns whether it was stored.
    pub async fn beat(&self, user_id: &str, session_id: &str, now: DateTime<Utc>) -> bool {
        let result = match self.pools.acquire(PoolClass::Background).await {
            Ok(client) => {
                client
                    .set(&heartbeat_key(user_id, session_id), &now.to_rfc3339(), Some(HEARTBEAT_TTL))
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.degraded.report("beat", &e);
                false
            }
        }
    }

    pub async fn last_beat(&self, user_id: &str, session_id: &str) -> Option<DateTime<Utc>> {
        let client = self.pools.acquire(PoolClass::Background).await.ok()?;
        let raw = client.get(&heartbeat_key(user_id, session_id)).await.ok()??;
        DateTime::parse_from_rfc3339(&raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use loomi_store::{InMemoryKv, NoopKv};

    #[tokio::test]
    async fn beat_round_trips_timestamp() {
        let tracker = HeartbeatTracker::new(Arc::new(PoolManager::with_defaults(Arc::new(InMemoryKv::new()))));
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(tracker.beat("u1", "s1", at).await);
        assert_eq!(tracker.last_beat("u1", "s1").await, Some(at));
        assert_eq!(tracker.last_beat("u1", "other").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn beat_expires() {
        let tracker = HeartbeatTracker::new(Arc::new(PoolManager::with_defaults(Arc::new(InMemoryKv::new()))));
        tracker.beat("u1", "s1", Utc::now()).await;
        tokio::time::advance(HEARTBEAT_TTL + Duration::from_secs(1)).await;
        assert!(tracker.last_beat("u1", "s1").await.is_none());
    }

    #[tokio::test]
    async fn unavailable_store_reports_failure() {
        let tracker = HeartbeatTracker::new(Arc::new(PoolManager::with_defaults(Arc::new(NoopKv))));
        assert!(!tracker.beat("u1", "s1", Utc::now()).await);
    }
}
