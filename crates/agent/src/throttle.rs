//! Gates that keep thought fragments from flooding the client stream.

use std::time::Duration;
use tokio::time::Instant;

use loomi_config::RuntimeConfig;

/// Per-chunk filter: drop fragments too short to be worth showing.
#[derive(Debug, Clone, Copy)]
pub struct ThoughtGate {
    pub enabled: bool,
    pub min_length: usize,
}

impl Default for ThoughtGate {
    fn default() -> Self {
        Self {
            enabled: true,
            min_length: 10,
        }
    }
}

impl ThoughtGate {
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self {
            enabled: runtime.thought_streaming_enabled,
            min_length: runtime.thought_min_length,
        }
    }

    pub fn should_emit_thought(&self, chunk: &str) -> bool {
        self.enabled && chunk.trim().chars().count() >= self.min_length
    }
}

/// Wall-clock gate: open at most once per `interval`.
#[derive(Debug)]
pub struct OutputThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl OutputThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True on the first call and then once the interval has elapsed since
    /// the last `true`.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}
