//! The orchestrator: one decision call, then a bounded fan-out of subagents.
//!
//! ```text
//!   request
//!      │
//!      ▼
//! ┌──────────────┐  <think>/<Observe> → context log, throttled thoughts
//! │ decision call│
//! └──────┬───────┘
//!        │ <Action type="…">…</Action>*
//!        ▼
//! ┌──────────────┐  at most `max_concurrent_agents` live at once
//! │   fan-out    │──► BaseAgent × N
//! └──────┬───────┘
//!        │ wait for every task
//!        ▼
//!   token summary → orchestrator_message
//! ```
//!
//! The first subagent error is kept and returned after every task has
//! finished. The summary is emitted unless the run was stopped; a stopped
//! run clears the session's stop flag once every task is done.

use async_trait::async_trait;
use loomi_config::RuntimeConfig;
use loomi_core::action::ActionKind;
use loomi_core::error::{Error, Result};
use loomi_core::event::{ContentKind, EventSink, StreamEvent};
use loomi_core::message::Message;
use loomi_core::provider::{ChunkHandler, ModelRequest, safe_stream_call};
use loomi_core::request::{ActionItem, AgentRequest};
use loomi_parser::{StreamingTagParser, parse_actions};
use loomi_session::{LayeredQueue, PromptSections, SubagentRateLimiter};
use loomi_store::{PoolClass, PoolManager};
use loomi_telemetry::{TokenSummary, estimate_tokens};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agent_loop::{AgentDeps, AgentOutcome, BaseAgent, LoopSettings};
use crate::references::resolve_references;
use crate::throttle::OutputThrottle;
use crate::tuning::AgentRole;

/// Queue the orchestrator records in-flight requests on.
pub const ORCHESTRATOR_QUEUE: &str = "orchestrator";

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub max_concurrent_agents: usize,
    /// Minimum spacing between orchestrator thought events.
    pub output_interval: Duration,
    /// Applied to the decision call and handed to every subagent.
    pub loop_settings: LoopSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 8,
            output_interval: Duration::from_secs(10),
            loop_settings: LoopSettings::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self {
            max_concurrent_agents: runtime.max_concurrent_agents.max(1),
            output_interval: runtime.output_interval(),
            loop_settings: LoopSettings::from_config(runtime),
        }
    }
}

/// What one orchestration did.
#[derive(Debug, Clone)]
pub struct OrchestrationReport {
    /// Actions that were dispatched, in decision order.
    pub actions: Vec<ActionItem>,
    pub unknown_actions: Vec<String>,
    /// Actions skipped by the per-user budget.
    pub rate_limited: Vec<ActionItem>,
    /// Successful subagent runs, in completion order.
    pub outcomes: Vec<AgentOutcome>,
    pub summary: TokenSummary,
}

pub struct Orchestrator {
    deps: AgentDeps,
    pools: Arc<PoolManager>,
    queue: Arc<LayeredQueue>,
    rate_limiter: Option<Arc<SubagentRateLimiter>>,
    settings: OrchestratorSettings,
    system_prompt: String,
}

impl Orchestrator {
    pub fn new(deps: AgentDeps, pools: Arc<PoolManager>) -> Self {
        Self {
            queue: Arc::new(LayeredQueue::new(pools.clone())),
            deps,
            pools,
            rate_limiter: None,
            settings: OrchestratorSettings::default(),
            system_prompt: orchestrator_prompt(),
        }
    }

    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_queue(mut self, queue: Arc<LayeredQueue>) -> Self {
        self.queue = queue;
        self
    }

    /// Bind fan-out to a per-user sliding-window budget.
    pub fn with_rate_limiter(mut self, limiter: Arc<SubagentRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn deps(&self) -> &AgentDeps {
        &self.deps
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Handle one request end to end.
    pub async fn run(&self, request: &AgentRequest, sink: Arc<dyn EventSink>) -> Result<OrchestrationReport> {
        let metrics = &self.deps.metrics;
        metrics.request_started();

        let result = self.orchestrate(request, sink).await;
        match &result {
            Ok(report) => {
                metrics.request_completed();
                info!(
                    user_id = %request.user_id,
                    session_id = %request.session_id,
                    subagents = report.outcomes.len(),
                    total_tokens = report.summary.total_tokens,
                    "Orchestration finished"
                );
            }
            Err(e) if e.is_stopped() => {
                metrics.request_stopped();
                self.deps.stop.clear(&request.user_id, &request.session_id).await;
                info!(user_id = %request.user_id, session_id = %request.session_id, "Orchestration stopped");
            }
            Err(e) => {
                metrics.request_failed();
                warn!(user_id = %request.user_id, session_id = %request.session_id, error = %e, "Orchestration failed");
            }
        }
        result
    }

    async fn orchestrate(&self, request: &AgentRequest, sink: Arc<dyn EventSink>) -> Result<OrchestrationReport> {
        let (user_id, session_id) = (request.user_id.as_str(), request.session_id.as_str());
        info!(user_id, session_id, "Orchestration started");

        // ── Setup ──
        self.pools.warm(&[PoolClass::HighPriority, PoolClass::Normal]).await;
        self.deps.tokens.initialize(user_id, session_id).await;
        self.deps.stop.check(user_id, session_id).await?;
        let selections = self.prepare_context(request).await;

        // ── Decision ──
        let response = self.decide(request, &selections, sink.as_ref()).await?;
        self.deps.stop.check(user_id, session_id).await?;
        if let Some(context) = &self.deps.context {
            context.record_orchestrator_buf(user_id, session_id, &response).await;
        }

        let item = request.session().to_string();
        self.queue.push(ORCHESTRATOR_QUEUE, &item).await;
        self.queue.mark_processing(ORCHESTRATOR_QUEUE, &item).await;

        let result = self.dispatch(request, &selections, &response, &sink).await;

        self.queue.mark_completed(ORCHESTRATOR_QUEUE, &item).await;
        result
    }

    /// Create the session context, log the message and resolve references in
    /// it. Returns the selections subagents should see.
    async fn prepare_context(&self, request: &AgentRequest) -> Vec<String> {
        let mut selections = request.selections.clone();
        let Some(context) = &self.deps.context else {
            return selections;
        };

        let state = context.create_context(&request.user_id, &request.session_id, None).await;
        for token in resolve_references(request.display_instruction(), &state) {
            if !selections.contains(&token) {
                selections.push(token);
            }
        }
        context
            .add_user_message(&request.user_id, &request.session_id, &request.instruction)
            .await;
        selections
    }

    async fn decide(&self, request: &AgentRequest, selections: &[String], sink: &dyn EventSink) -> Result<String> {
        let role = AgentRole::Orchestrator;
        let prompt = match &self.deps.context {
            Some(context) => {
                let formatted = context
                    .format_context_for_prompt(
                        &request.user_id,
                        &request.session_id,
                        role.name(),
                        PromptSections::default(),
                        selections,
                    )
                    .await;
                format!("{}\n\n{formatted}", request.instruction)
            }
            None => request.instruction.clone(),
        };

        let model_request = role.tune(
            ModelRequest::new(
                &request.user_id,
                &request.session_id,
                vec![Message::system(self.system_prompt.clone()), Message::user(prompt)],
            ),
            self.deps.client.as_ref(),
        );

        let mut handler = DecisionChunks {
            orchestrator: self,
            request,
            sink,
            tags: StreamingTagParser::for_orchestrator(),
            throttle: OutputThrottle::new(self.settings.output_interval),
            response: String::new(),
            chunks: 0,
        };
        safe_stream_call(
            self.deps.client.as_ref(),
            self.settings.loop_settings.call_context(),
            model_request,
            &mut handler,
        )
        .await?;

        debug!(
            chunks = handler.chunks,
            narration = %handler.tags.unprocessed_content(),
            "Decision stream finished"
        );
        Ok(handler.response)
    }

    async fn dispatch(
        &self,
        request: &AgentRequest,
        selections: &[String],
        response: &str,
        sink: &Arc<dyn EventSink>,
    ) -> Result<OrchestrationReport> {
        let (user_id, session_id) = (request.user_id.as_str(), request.session_id.as_str());
        let parsed = parse_actions(response);
        let mut first_error: Option<Error> = None;

        if !parsed.unknown.is_empty() {
            warn!(user_id, session_id, unknown = ?parsed.unknown, "Decision named unknown actions");
            let event = StreamEvent::chunk(
                ContentKind::SystemMessage,
                serde_json::json!({ "unknown_actions": parsed.unknown }),
            );
            if let Err(e) = sink.emit(event).await {
                first_error.get_or_insert(e);
            }
        }

        info!(user_id, session_id, actions = parsed.items.len(), "Dispatching subagents");

        // ── Fan-out ──
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_agents.max(1)));
        let mut tasks: JoinSet<(ActionKind, Result<AgentOutcome>)> = JoinSet::new();
        let mut dispatched = Vec::new();
        let mut rate_limited = Vec::new();

        for item in parsed.items {
            if let Some(limiter) = &self.rate_limiter {
                if !limiter.try_acquire(user_id).await {
                    self.deps.metrics.subagent_rate_limited();
                    warn!(user_id, agent = item.action_type.slug(), "Subagent skipped by rate limit");
                    let event = StreamEvent::chunk(
                        ContentKind::SystemMessage,
                        serde_json::json!({
                            "rate_limited_action": item.action_type.slug(),
                            "instruction": item.instruction,
                        }),
                    );
                    if let Err(e) = sink.emit(event).await {
                        first_error.get_or_insert(e);
                    }
                    rate_limited.push(item);
                    continue;
                }
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    first_error.get_or_insert(Error::Internal("subagent semaphore closed".into()));
                    break;
                }
            };

            let agent = BaseAgent::for_action(self.deps.clone(), item.action_type)
                .with_settings(self.settings.loop_settings);
            let sub_request = request
                .for_action(item.instruction.clone())
                .with_selections(selections.to_vec());
            let metrics = self.deps.metrics.clone();
            let sink = sink.clone();
            let action = item.action_type;
            debug!(agent = action.slug(), "Spawning subagent");

            tasks.spawn(async move {
                let _permit = permit;
                let _active = metrics.subagent_started();
                let result = agent.run(&sub_request, sink.as_ref()).await;
                (action, result)
            });
            dispatched.push(item);
        }

        // ── Drain: every task finishes before we return ──
        let mut outcomes = Vec::with_capacity(dispatched.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => outcomes.push(outcome),
                Ok((action, Err(e))) => {
                    if !e.is_stopped() {
                        self.deps.metrics.subagent_failed();
                    }
                    warn!(agent = action.slug(), error = %e, "Subagent returned an error");
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    self.deps.metrics.subagent_failed();
                    warn!(error = %join_error, "Subagent task did not complete");
                    first_error.get_or_insert(Error::Internal(format!("subagent task failed: {join_error}")));
                }
            }
        }

        if let Some(e) = first_error.take_if(|e| e.is_stopped()) {
            debug!(user_id, session_id, finished = outcomes.len(), "Fan-out stopped, skipping summary");
            return Err(e);
        }

        // ── Summary ──
        let summary = self.deps.tokens.summary(user_id, session_id).await;
        let event = StreamEvent::chunk(
            ContentKind::OrchestratorMessage,
            serde_json::json!({ "total_tokens": summary.total_tokens, "cost": summary.cost }),
        )
        .with_meta("instruction", request.display_instruction())
        .with_meta("subagents", dispatched.len());
        if let Err(e) = sink.emit(event).await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(OrchestrationReport {
                actions: dispatched,
                unknown_actions: parsed.unknown,
                rate_limited,
                outcomes,
                summary,
            }),
        }
    }
}

struct DecisionChunks<'a> {
    orchestrator: &'a Orchestrator,
    request: &'a AgentRequest,
    sink: &'a dyn EventSink,
    tags: StreamingTagParser,
    throttle: OutputThrottle,
    response: String,
    chunks: usize,
}

#[async_trait]
impl<'a> ChunkHandler for DecisionChunks<'a> {
    async fn on_chunk(&mut self, text: &str) -> Result<()> {
        let deps = &self.orchestrator.deps;
        let settings = &self.orchestrator.settings.loop_settings;
        let (user_id, session_id) = (self.request.user_id.as_str(), self.request.session_id.as_str());

        self.response.push_str(text);
        self.chunks += 1;

        if self.chunks % settings.stop_check_interval.max(1) == 0 {
            deps.stop.check(user_id, session_id).await?;
        }

        deps.tokens.add(user_id, session_id, estimate_tokens(text)).await;

        for tag in self.tags.add_chunk(text) {
            debug!(tag = %tag.tag, "Orchestrator tag completed");
            if let Some(context) = &deps.context {
                context
                    .add_orchestrator_call(user_id, session_id, &tag.tag, &tag.content)
                    .await;
            }
        }

        if settings.thought_gate.should_emit_thought(text) && self.throttle.should_emit() {
            self.sink
                .emit(StreamEvent::chunk(ContentKind::Thought, text).with_meta("agent", AgentRole::Orchestrator.name()))
                .await?;
            deps.metrics.thought_emitted();
        } else {
            deps.metrics.thought_suppressed();
        }
        Ok(())
    }
}

fn orchestrator_prompt() -> String {
    let catalog: Vec<String> = ActionKind::ALL
        .iter()
        .map(|kind| format!("- {}: {}", kind.slug(), kind.display_name()))
        .collect();
    format!(
        "You coordinate a team of content specialists. Read the user's request, reason inside \
         <think>…</think>, note what you learn about the user inside <Observe>…</Observe>, then \
         delegate. For each specialist you need, write one <Action type=\"slug\">instruction</Action> \
         block with a self-contained instruction. Use only these slugs:\n{}\n\nIf nothing needs \
         delegating, answer directly without any Action block.",
        catalog.join("\n")
    )
}
