//! Named FIFO work queues with an in-flight marker.
//!
//! Items are pushed at the head of `loomi:queue:<name>` and popped from the
//! tail. `mark_processing` writes `loomi:processing:<name>:<item>` with the
//! queue timeout as TTL; entries that outlive it are abandoned and left for
//! external tooling to reap. `mark_completed` clears the marker and drops the
//! item from the list if nobody popped it.

use chrono::Utc;
use loomi_store::{DegradeLog, PoolClass, PoolManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(300);

pub fn queue_key(name: &str) -> String {
    format!("loomi:queue:{name}")
}

pub fn processing_key(name: &str, item: &str) -> String {
    format!("loomi:processing:{name}:{item}")
}

pub struct LayeredQueue {
    pools: Arc<PoolManager>,
    timeout: Duration,
    degraded: DegradeLog,
}

impl LayeredQueue {
    pub fn new(pools: Arc<PoolManager>) -> Self {
        Self {
            pools,
            timeout: DEFAULT_QUEUE_TIMEOUT,
            degraded: DegradeLog::new("layered_queue"),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Enqueue an item. Returns the queue length, or `None` when the store
    /// is unavailable.
    pub async fn push(&self, name: &str, item: &str) -> Option<u64> {
        let client = match self.pools.acquire(PoolClass::Background).await {
            Ok(client) => client,
            Err(e) => {
                self.degraded.report("push", &e);
                return None;
            }
        };
        match client.lpush(&queue_key(name), item).await {
            Ok(len) => {
                debug!(queue = name, item, len, "Queued");
                Some(len)
            }
            Err(e) => {
                self.degraded.report("push", &e);
                None
            }
        }
    }

    /// Dequeue the oldest item, waiting up to the queue timeout.
    pub async fn pop(&self, name: &str) -> Option<String> {
        self.pop_with_timeout(name, self.timeout).await
    }

    pub async fn pop_with_timeout(&self, name: &str, timeout: Duration) -> Option<String> {
        let client = match self.pools.acquire(PoolClass::Background).await {
            Ok(client) => client,
            Err(e) => {
                self.degraded.report("pop", &e);
                return None;
            }
        };
        match client.brpop(&queue_key(name), timeout).await {
            Ok(item) => item,
            Err(e) => {
                self.degraded.report("pop", &e);
                None
            }
        }
    }

    pub async fn mark_processing(&self, name: &str, item: &str) {
        let stamp = Utc::now().to_rfc3339();
        let result = match self.pools.acquire(PoolClass::Background).await {
            Ok(client) => client.set(&processing_key(name, item), &stamp, Some(self.timeout)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.degraded.report("mark_processing", &e);
        }
    }

    pub async fn mark_completed(&self, name: &str, item: &str) {
        let client = match self.pools.acquire(PoolClass::Background).await {
            Ok(client) => client,
            Err(e) => return self.degraded.report("mark_completed", &e),
        };
        if let Err(e) = client.del(&[processing_key(name, item)]).await {
            self.degraded.report("mark_completed", &e);
        }
        if let Err(e) = client.lrem(&queue_key(name), item).await {
            self.degraded.report("mark_completed", &e);
        }
    }

    /// Whether an item currently carries an in-flight marker.
    pub async fn is_processing(&self, name: &str, item: &str) -> bool {
        match self.pools.acquire(PoolClass::Background).await {
            Ok(client) => matches!(client.get(&processing_key(name, item)).await, Ok(Some(_))),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomi_store::{InMemoryKv, NoopKv};

    fn queue() -> LayeredQueue {
        LayeredQueue::new(Arc::new(PoolManager::with_defaults(Arc::new(InMemoryKv::new()))))
    }

    #[tokio::test]
    async fn push_pop_is_fifo() {
        let q = queue();
        assert_eq!(q.push("orchestrator", "u1:s1").await, Some(1));
        assert_eq!(q.push("orchestrator", "u2:s2").await, Some(2));

        let timeout = Duration::from_millis(10);
        assert_eq!(q.pop_with_timeout("orchestrator", timeout).await.as_deref(), Some("u1:s1"));
        assert_eq!(q.pop_with_timeout("orchestrator", timeout).await.as_deref(), Some("u2:s2"));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_on_empty_queue_times_out() {
        let q = queue().with_timeout(Duration::from_secs(300));
        assert!(q.pop("empty").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn processing_marker_lifecycle() {
        let q = queue();
        q.mark_processing("orchestrator", "u1:s1").await;
        assert!(q.is_processing("orchestrator", "u1:s1").await);

        q.mark_completed("orchestrator", "u1:s1").await;
        assert!(!q.is_processing("orchestrator", "u1:s1").await);

        // Abandoned markers expire with the queue timeout
        q.mark_processing("orchestrator", "u2:s2").await;
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(!q.is_processing("orchestrator", "u2:s2").await);
    }

    #[tokio::test]
    async fn completed_items_leave_the_queue() {
        let kv = Arc::new(InMemoryKv::new());
        let q = LayeredQueue::new(Arc::new(PoolManager::with_defaults(kv.clone())));
        for item in ["u1:s1", "u2:s2"] {
            q.push("orchestrator", item).await;
            q.mark_processing("orchestrator", item).await;
        }

        q.mark_completed("orchestrator", "u1:s1").await;
        let remaining = q.pop_with_timeout("orchestrator", Duration::from_millis(10)).await;
        assert_eq!(remaining.as_deref(), Some("u2:s2"));

        q.mark_completed("orchestrator", "u2:s2").await;
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn unavailable_store_is_tolerated() {
        let q = LayeredQueue::new(Arc::new(PoolManager::with_defaults(Arc::new(NoopKv))));
        assert_eq!(q.push("orchestrator", "x").await, None);
        assert!(q.pop_with_timeout("orchestrator", Duration::from_millis(1)).await.is_none());
        q.mark_processing("orchestrator", "x").await;
        q.mark_completed("orchestrator", "x").await;
    }
}
