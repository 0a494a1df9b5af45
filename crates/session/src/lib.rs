//! Per-session coordination for loomi.
//!
//! Everything here is keyed by `(user_id, session_id)` and sits on the shared
//! key-value store through a [`loomi_store::PoolManager`]. Store failures never
//! surface to callers: each component logs once and carries on.

pub mod context;
pub mod heartbeat;
pub mod notes;
pub mod queue;
pub mod rate_limit;
pub mod stop;

pub use context::{ContextManager, ContextState, ContextUpdate, CreatedNote, PromptSections};
pub use heartbeat::HeartbeatTracker;
pub use notes::NotesService;
pub use queue::LayeredQueue;
pub use rate_limit::SubagentRateLimiter;
pub use stop::StopManager;
