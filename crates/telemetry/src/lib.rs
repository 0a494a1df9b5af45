//! Token accounting and runtime metrics for loomi.
//!
//! [`TokenAccumulator`] keeps advisory per-session token counters in the
//! shared store and prices them for the billing summary. [`RuntimeMetrics`]
//! counts requests, subagents and thought emission for health reporting.

pub mod metrics;
pub mod tokens;

pub use metrics::{ActiveSubagent, MetricsSnapshot, RuntimeMetrics};
pub use tokens::{TokenAccumulator, TokenSummary, estimate_tokens};
