//! In-memory key-value backend, used for tests and single-process deployments.

use async_trait::async_trait;
use loomi_core::error::StoreError;
use loomi_core::kv::{KvStore, StoreResult};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// An in-memory store with Redis-like semantics: string, list and sorted-set
/// values, per-key TTLs, and glob `SCAN`.
///
/// Expired entries are dropped when a read finds them and in bulk at the
/// start of every `SCAN` iteration. Expiry follows `tokio::time`, so
/// paused-clock tests can advance past TTLs.
pub struct InMemoryKv {
    entries: Arc<RwLock<BTreeMap<String, Entry>>>,
    pushed: Arc<Notify>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
            pushed: Arc::new(Notify::new()),
        }
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().await.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of stored keys, expired or not.
    pub async fn stored_len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Drop every expired entry; returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }

    /// Remove `keys` that have expired by `now`.
    async fn evict(&self, keys: &[&str], now: Instant) {
        if keys.is_empty() {
            return;
        }
        let mut entries = self.entries.write().await;
        for key in keys {
            if entries.get(*key).is_some_and(|e| !e.is_live(now)) {
                entries.remove(*key);
            }
        }
    }

    /// Remaining TTL of a key, if it has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        let entry = entries.get(key).filter(|e| e.is_live(now))?;
        entry.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop the entry if it has expired, then hand back the live one.
fn live_entry<'a>(map: &'a mut BTreeMap<String, Entry>, key: &str, now: Instant) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| !e.is_live(now)) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType { key: key.to_string() }
}

#[async_trait]
impl KvStore for InMemoryKv {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return Ok(None),
                Some(entry) if entry.is_live(now) => {
                    return match &entry.value {
                        Value::Str(s) => Ok(Some(s.clone())),
                        _ => Err(wrong_type(key)),
                    };
                }
                Some(_) => {}
            }
        }
        self.evict(&[key], now).await;
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut entry = Entry::new(Value::Str(value.to_string()));
        entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let mut removed = 0;
        for key in keys {
            if let Some(entry) = entries.remove(key) {
                if entry.is_live(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn incr(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match live_entry(&mut entries, key, now) {
            Some(entry) => match &mut entry.value {
                Value::Str(s) => {
                    let current: i64 = s
                        .parse()
                        .map_err(|_| StoreError::NotAnInteger { key: key.to_string() })?;
                    let next = current
                        .checked_add(delta)
                        .ok_or_else(|| StoreError::NotAnInteger { key: key.to_string() })?;
                    *s = next.to_string();
                    Ok(next)
                }
                _ => Err(wrong_type(key)),
            },
            None => {
                entries.insert(key.to_string(), Entry::new(Value::Str(delta.to_string())));
                Ok(delta)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if live_entry(&mut entries, key, now).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::ZSet(HashMap::new())));
        }
        match entries.get_mut(key).map(|e| &mut e.value) {
            Some(Value::ZSet(set)) => Ok(set.insert(member.to_string(), score).is_none()),
            _ => Err(wrong_type(key)),
        }
    }

    async fn zrem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let Some(entry) = live_entry(&mut entries, key, now) else {
            return Ok(0);
        };
        let Value::ZSet(set) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let before = set.len();
        set.retain(|_, score| *score < min || *score > max);
        let removed = (before - set.len()) as u64;
        if set.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| e.is_live(now)).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::ZSet(set)) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> StoreResult<(u64, Vec<String>)> {
        if cursor == 0 {
            self.purge_expired().await;
        }
        let now = Instant::now();
        let entries = self.entries.read().await;
        let live: Vec<&String> = entries
            .iter()
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, _)| k)
            .collect();

        let start = (cursor as usize).min(live.len());
        let end = start.saturating_add(count.max(1)).min(live.len());
        let page = live[start..end]
            .iter()
            .filter(|k| crate::glob::glob_match(pattern, k))
            .map(|k| (*k).clone())
            .collect();

        let next = if end >= live.len() { 0 } else { end as u64 };
        Ok((next, page))
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let len = {
            let mut entries = self.entries.write().await;
            if live_entry(&mut entries, key, now).is_none() {
                entries.insert(key.to_string(), Entry::new(Value::List(VecDeque::new())));
            }
            match entries.get_mut(key).map(|e| &mut e.value) {
                Some(Value::List(list)) => {
                    list.push_front(value.to_string());
                    list.len() as u64
                }
                _ => return Err(wrong_type(key)),
            }
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let Some(entry) = live_entry(&mut entries, key, now) else {
            return Ok(0);
        };
        let Value::List(list) = &mut entry.value else {
            return Err(wrong_type(key));
        };
        let before = list.len();
        list.retain(|item| item != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a push between check and wait is not lost
            let notified = self.pushed.notified();
            {
                let now = Instant::now();
                let mut entries = self.entries.write().await;
                if let Some(entry) = live_entry(&mut entries, key, now) {
                    let Value::List(list) = &mut entry.value else {
                        return Err(wrong_type(key));
                    };
                    let popped = list.pop_back();
                    if list.is_empty() {
                        entries.remove(key);
                    }
                    if popped.is_some() {
                        return Ok(popped);
                    }
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let values: Vec<Option<String>> = {
            let entries = self.entries.read().await;
            keys.iter()
                .map(|key| match entries.get(key) {
                    Some(entry) if !entry.is_live(now) => {
                        expired.push(key.as_str());
                        None
                    }
                    Some(Entry {
                        value: Value::Str(s), ..
                    }) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        };
        self.evict(&expired, now).await;
        Ok(values)
    }

    async fn sliding_window_acquire(
        &self,
        key: &str,
        window: Duration,
        limit: u64,
        now_ms: i64,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if live_entry(&mut entries, key, now).is_none() {
            entries.insert(key.to_string(), Entry::new(Value::ZSet(HashMap::new())));
        }
        let Some(entry) = entries.get_mut(key) else {
            return Ok(false);
        };
        let Value::ZSet(set) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        let floor = (now_ms - window.as_millis() as i64) as f64;
        set.retain(|_, score| *score > floor);

        let admitted = (set.len() as u64) < limit;
        if admitted {
            // Unique member per admission, even for identical timestamps
            let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
            set.insert(member, now_ms as f64);
        }
        entry.expires_at = Some(now + window);
        Ok(admitted)
    }
}
