//! Priority-class connection pools over a shared [`KvStore`].
//!
//! Each class is a counting semaphore sized from configuration. A caller
//! acquires a [`PooledClient`] for the duration of one store interaction;
//! acquisition waits at most `acquire_timeout` and then fails so callers can
//! degrade instead of blocking the user-visible stream.

use loomi_core::error::StoreError;
use loomi_core::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Named pool classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolClass {
    HighPriority,
    Normal,
    Background,
}

impl PoolClass {
    pub const ALL: [PoolClass; 3] = [Self::HighPriority, Self::Normal, Self::Background];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighPriority => "high_priority",
            Self::Normal => "normal",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for PoolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacities per class.
#[derive(Debug, Clone, Copy)]
pub struct PoolSizes {
    pub high_priority: usize,
    pub normal: usize,
    pub background: usize,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            high_priority: 200,
            normal: 100,
            background: 50,
        }
    }
}

/// Hands out store clients per priority class.
pub struct PoolManager {
    kv: Arc<dyn KvStore>,
    high_priority: Arc<Semaphore>,
    normal: Arc<Semaphore>,
    background: Arc<Semaphore>,
    sizes: PoolSizes,
    acquire_timeout: Duration,
}

impl PoolManager {
    pub fn new(kv: Arc<dyn KvStore>, sizes: PoolSizes, acquire_timeout: Duration) -> Self {
        Self {
            kv,
            high_priority: Arc::new(Semaphore::new(sizes.high_priority)),
            normal: Arc::new(Semaphore::new(sizes.normal)),
            background: Arc::new(Semaphore::new(sizes.background)),
            sizes,
            acquire_timeout,
        }
    }

    /// Default capacities and a 250 ms acquisition bound.
    pub fn with_defaults(kv: Arc<dyn KvStore>) -> Self {
        Self::new(kv, PoolSizes::default(), Duration::from_millis(250))
    }

    fn semaphore(&self, class: PoolClass) -> &Arc<Semaphore> {
        match class {
            PoolClass::HighPriority => &self.high_priority,
            PoolClass::Normal => &self.normal,
            PoolClass::Background => &self.background,
        }
    }

    pub fn capacity(&self, class: PoolClass) -> usize {
        match class {
            PoolClass::HighPriority => self.sizes.high_priority,
            PoolClass::Normal => self.sizes.normal,
            PoolClass::Background => self.sizes.background,
        }
    }

    /// Free slots in a class right now.
    pub fn available(&self, class: PoolClass) -> usize {
        self.semaphore(class).available_permits()
    }

    /// The backend name of the underlying store.
    pub fn backend_name(&self) -> &str {
        self.kv.name()
    }

    /// Acquire a client from `class`, waiting at most the configured timeout.
    pub async fn acquire(&self, class: PoolClass) -> Result<PooledClient, StoreError> {
        let semaphore = self.semaphore(class).clone();
        let permit = tokio::time::timeout(self.acquire_timeout, semaphore.acquire_owned())
            .await
            .map_err(|_| StoreError::PoolExhausted {
                pool: class.as_str().to_string(),
                waited_ms: self.acquire_timeout.as_millis() as u64,
            })?
            .map_err(|_| StoreError::Unavailable(format!("pool {class} closed")))?;

        Ok(PooledClient {
            kv: self.kv.clone(),
            class,
            _permit: permit,
        })
    }

    /// Best-effort ping through each named pool. Failures are logged, never
    /// returned.
    pub async fn warm(&self, classes: &[PoolClass]) {
        for class in classes {
            match self.acquire(*class).await {
                Ok(client) => {
                    if let Err(e) = client.ping().await {
                        debug!(pool = %class, error = %e, "Pool warm-up ping failed");
                    }
                }
                Err(e) => warn!(pool = %class, error = %e, "Pool warm-up could not acquire a client"),
            }
        }
    }

    /// Ping through the high-priority pool.
    pub async fn ping(&self) -> Result<(), StoreError> {
        self.acquire(PoolClass::HighPriority).await?.ping().await
    }
}

/// A store handle holding one slot of its pool until dropped.
pub struct PooledClient {
    kv: Arc<dyn KvStore>,
    class: PoolClass,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn class(&self) -> PoolClass {
        self.class
    }
}

impl Deref for PooledClient {
    type Target = dyn KvStore;

    fn deref(&self) -> &Self::Target {
        self.kv.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryKv, NoopKv};

    #[tokio::test]
    async fn acquire_and_use_client() {
        let pools = PoolManager::with_defaults(Arc::new(InMemoryKv::new()));
        let client = pools.acquire(PoolClass::Normal).await.unwrap();
        client.set("k", "v", None).await.unwrap();
        assert_eq!(client.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(pools.available(PoolClass::Normal), 99);
        drop(client);
        assert_eq!(pools.available(PoolClass::Normal), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_times_out() {
        let sizes = PoolSizes {
            high_priority: 1,
            normal: 1,
            background: 1,
        };
        let pools = PoolManager::new(Arc::new(InMemoryKv::new()), sizes, Duration::from_millis(50));
        let _held = pools.acquire(PoolClass::Background).await.unwrap();

        let err = pools.acquire(PoolClass::Background).await.err().unwrap();
        assert!(matches!(err, StoreError::PoolExhausted { ref pool, .. } if pool == "background"));

        // Other classes are independent
        assert!(pools.acquire(PoolClass::HighPriority).await.is_ok());
    }

    #[tokio::test]
    async fn warm_tolerates_unavailable_store() {
        let pools = PoolManager::with_defaults(Arc::new(NoopKv));
        pools.warm(&[PoolClass::HighPriority, PoolClass::Normal]).await;
        assert!(pools.ping().await.is_err());
        assert_eq!(pools.available(PoolClass::HighPriority), 200);
    }

    #[test]
    fn class_names() {
        assert_eq!(PoolClass::HighPriority.to_string(), "high_priority");
        assert_eq!(PoolClass::ALL.len(), 3);
    }
}
