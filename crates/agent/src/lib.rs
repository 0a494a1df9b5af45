//! Agents for loomi.
//!
//! A request flows through two layers:
//!
//! 1. The **orchestrator** streams one decision call, recording each
//!    `<think>`/`<Action>` fragment into the session context as it closes.
//! 2. The decided actions fan out to **subagents**, all running the same
//!    [`BaseAgent`] loop specialized by a [`SubagentSpec`], bounded by a
//!    semaphore and cancelled cooperatively through the stop flag.
//!
//! Every event reaches the caller through a single [`loomi_core::EventSink`].

pub mod agent_loop;
pub mod orchestrator;
pub mod references;
pub mod runtime;
pub mod subagents;
pub mod throttle;
pub mod tuning;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use agent_loop::{AgentDeps, AgentOutcome, BaseAgent, EmittedBlock, LoopSettings};
pub use orchestrator::{ORCHESTRATOR_QUEUE, OrchestrationReport, Orchestrator, OrchestratorSettings};
pub use references::resolve_references;
pub use runtime::Runtime;
pub use subagents::SubagentSpec;
pub use throttle::{OutputThrottle, ThoughtGate};
pub use tuning::AgentRole;
