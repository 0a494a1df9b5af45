//! Process-wide runtime counters.
//!
//! Lock-free atomics updated on the hot path; [`RuntimeMetrics::snapshot`]
//! produces a serializable view for `/health` and external monitoring.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    requests_started: AtomicU64,
    requests_completed: AtomicU64,
    requests_stopped: AtomicU64,
    requests_failed: AtomicU64,
    subagents_started: AtomicU64,
    subagents_failed: AtomicU64,
    subagents_rate_limited: AtomicU64,
    active_subagents: AtomicU64,
    peak_subagents: AtomicU64,
    thoughts_emitted: AtomicU64,
    thoughts_suppressed: AtomicU64,
}

/// Point-in-time copy of [`RuntimeMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_started: u64,
    pub requests_completed: u64,
    pub requests_stopped: u64,
    pub requests_failed: u64,
    pub subagents_started: u64,
    pub subagents_failed: u64,
    pub subagents_rate_limited: u64,
    pub active_subagents: u64,
    pub peak_subagents: u64,
    pub thoughts_emitted: u64,
    pub thoughts_suppressed: u64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_started(&self) {
        self.requests_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_stopped(&self) {
        self.requests_stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subagent_failed(&self) {
        self.subagents_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subagent_rate_limited(&self) {
        self.subagents_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn thought_emitted(&self) {
        self.thoughts_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn thought_suppressed(&self) {
        self.thoughts_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark a subagent as running. The returned guard decrements the live
    /// count when dropped and the peak is raised as needed.
    pub fn subagent_started(self: &Arc<Self>) -> ActiveSubagent {
        self.subagents_started.fetch_add(1, Ordering::Relaxed);
        let now = self.active_subagents.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_subagents.fetch_max(now, Ordering::SeqCst);
        ActiveSubagent {
            metrics: Arc::clone(self),
        }
    }

    pub fn active_subagents(&self) -> u64 {
        self.active_subagents.load(Ordering::SeqCst)
    }

    pub fn peak_subagents(&self) -> u64 {
        self.peak_subagents.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_started: self.requests_started.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_stopped: self.requests_stopped.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            subagents_started: self.subagents_started.load(Ordering::Relaxed),
            subagents_failed: self.subagents_failed.load(Ordering::Relaxed),
            subagents_rate_limited: self.subagents_rate_limited.load(Ordering::Relaxed),
            active_subagents: self.active_subagents.load(Ordering::SeqCst),
            peak_subagents: self.peak_subagents.load(Ordering::SeqCst),
            thoughts_emitted: self.thoughts_emitted.load(Ordering::Relaxed),
            thoughts_suppressed: self.thoughts_suppressed.load(Ordering::Relaxed),
        }
    }
}

/// Live-subagent marker returned by [`RuntimeMetrics::subagent_started`].
#[derive(Debug)]
pub struct ActiveSubagent {
    metrics: Arc<RuntimeMetrics>,
}

impl Drop for ActiveSubagent {
    fn drop(&mut self) {
        self.metrics.active_subagents.fetch_sub(1, Ordering::SeqCst);
    }
}
