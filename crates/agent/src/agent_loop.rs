//! The loop every subagent runs.
//!
//! One streamed model call per request. Each chunk goes through, in order:
//! a cooperative stop check (every `stop_check_interval` chunks), token
//! accounting, the thought gate, and the block parser. After the call the
//! parsed blocks get session-unique ids, are normalized, emitted as a single
//! event and saved as notes. A response without blocks is emitted raw.

use async_trait::async_trait;
use loomi_config::RuntimeConfig;
use loomi_core::action::ActionKind;
use loomi_core::error::{Error, Result};
use loomi_core::event::{ContentKind, EventSink, StreamEvent};
use loomi_core::message::Message;
use loomi_core::provider::{CallContext, ChunkHandler, ModelClient, ModelRequest, Usage, safe_stream_call};
use loomi_core::request::AgentRequest;
use loomi_parser::{BlockParser, markdown};
use loomi_session::{ContextManager, NotesService, PromptSections, StopManager};
use loomi_store::{DegradeLog, PoolManager};
use loomi_telemetry::{RuntimeMetrics, TokenAccumulator, estimate_tokens};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::subagents::SubagentSpec;
use crate::throttle::ThoughtGate;

/// Collaborators shared by the orchestrator and every subagent.
#[derive(Clone)]
pub struct AgentDeps {
    pub client: Arc<dyn ModelClient>,
    pub stop: Arc<StopManager>,
    pub tokens: Arc<TokenAccumulator>,
    /// Prompt context and id allocation; without it ids fall back to note
    /// counts.
    pub context: Option<Arc<ContextManager>>,
    pub notes: Option<Arc<NotesService>>,
    pub metrics: Arc<RuntimeMetrics>,
}

impl AgentDeps {
    pub fn new(client: Arc<dyn ModelClient>, pools: Arc<PoolManager>) -> Self {
        Self {
            client,
            stop: Arc::new(StopManager::new(pools.clone())),
            tokens: Arc::new(TokenAccumulator::new(pools)),
            context: None,
            notes: None,
            metrics: Arc::new(RuntimeMetrics::new()),
        }
    }

    pub fn with_stop(mut self, stop: Arc<StopManager>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_tokens(mut self, tokens: Arc<TokenAccumulator>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_context(mut self, context: Arc<ContextManager>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_notes(mut self, notes: Arc<NotesService>) -> Self {
        self.notes = Some(notes);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Knobs for the per-chunk pipeline.
#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Chunks between cooperative stop checks.
    pub stop_check_interval: usize,
    pub thought_gate: ThoughtGate,
    /// Delete the session's stop flag before starting. Off under the
    /// orchestrator, where a stop must reach every sibling.
    pub clear_stop_on_start: bool,
    /// Ambient deadline for the model call.
    pub call_timeout: Option<Duration>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            stop_check_interval: 10,
            thought_gate: ThoughtGate::default(),
            clear_stop_on_start: false,
            call_timeout: None,
        }
    }
}

impl LoopSettings {
    pub fn from_config(runtime: &RuntimeConfig) -> Self {
        Self {
            stop_check_interval: runtime.stop_check_interval.max(1),
            thought_gate: ThoughtGate::from_config(runtime),
            ..Self::default()
        }
    }

    pub fn call_context(&self) -> CallContext {
        match self.call_timeout {
            Some(timeout) => CallContext::with_timeout(timeout),
            None => CallContext::default(),
        }
    }
}

/// A block as delivered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmittedBlock {
    /// Session-unique id, `<action><n>`.
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// What a finished subagent run produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub action: ActionKind,
    pub blocks: Vec<EmittedBlock>,
    /// The full model response.
    pub response: String,
    /// Text outside the blocks, when any.
    pub other_content: Option<String>,
    pub usage: Option<Usage>,
}

pub struct BaseAgent {
    deps: AgentDeps,
    spec: SubagentSpec,
    settings: LoopSettings,
    note_failures: DegradeLog,
}

impl BaseAgent {
    pub fn new(deps: AgentDeps, spec: SubagentSpec) -> Self {
        Self {
            deps,
            spec,
            settings: LoopSettings::default(),
            note_failures: DegradeLog::new("agent_notes"),
        }
    }

    pub fn for_action(deps: AgentDeps, action: ActionKind) -> Self {
        Self::new(deps, SubagentSpec::for_action(action))
    }

    pub fn with_settings(mut self, settings: LoopSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn spec(&self) -> &SubagentSpec {
        &self.spec
    }

    /// Run one request to completion.
    ///
    /// Returns `Error::Stopped` when the session's stop flag is observed;
    /// in that case a `billing_summary` event has been emitted and the
    /// session's token buckets are cleared.
    pub async fn run(&self, request: &AgentRequest, sink: &dyn EventSink) -> Result<AgentOutcome> {
        let (user_id, session_id) = (request.user_id.as_str(), request.session_id.as_str());
        let slug = self.spec.slug();
        info!(user_id, session_id, agent = slug, "Subagent started");

        if self.settings.clear_stop_on_start {
            self.deps.stop.clear(user_id, session_id).await;
        }
        if let Err(e) = self.deps.stop.check(user_id, session_id).await {
            return Err(self.finish_stopped(request, sink, e).await);
        }

        let role = self.spec.role();
        let prompt = self.build_prompt(request).await;
        let model_request = role.tune(
            ModelRequest::new(
                user_id,
                session_id,
                vec![Message::system(self.spec.system_prompt.clone()), Message::user(prompt)],
            ),
            self.deps.client.as_ref(),
        );

        let parser = BlockParser::new(self.spec.block.clone())
            .ok_or_else(|| Error::Internal(format!("unusable block tag {:?}", self.spec.block.tag)))?;
        let mut handler = SubagentChunks {
            agent: self,
            request,
            sink,
            parser,
            response: String::new(),
            chunks: 0,
        };

        let call = safe_stream_call(
            self.deps.client.as_ref(),
            self.settings.call_context(),
            model_request,
            &mut handler,
        )
        .await;
        let usage = match call {
            Ok(usage) => usage,
            Err(e) if e.is_stopped() => return Err(self.finish_stopped(request, sink, e).await),
            Err(e) => {
                warn!(user_id, session_id, agent = slug, error = %e, "Subagent model call failed");
                return Err(e);
            }
        };
        if let Err(e) = self.deps.stop.check(user_id, session_id).await {
            return Err(self.finish_stopped(request, sink, e).await);
        }

        let SubagentChunks { parser, response, chunks, .. } = handler;
        let other = parser.other_content();
        let parsed = parser.blocks().to_vec();
        debug!(agent = slug, chunks, blocks = parsed.len(), "Subagent stream finished");

        let ids = self.allocate_ids(user_id, session_id, parsed.len()).await;
        let blocks: Vec<EmittedBlock> = parsed
            .into_iter()
            .zip(ids)
            .enumerate()
            .map(|(index, (block, id))| EmittedBlock {
                id: format!("{slug}{id}"),
                title: block.title.unwrap_or_else(|| self.spec.default_title(index)),
                content: markdown::normalize(&block.content),
                cover_text: block.cover_text.map(|t| markdown::normalize(&t)),
                hook: block.hook.map(|t| markdown::normalize(&t)),
                kind: slug.to_string(),
            })
            .collect();

        let other_content = Some(other).filter(|o| !o.is_empty() && !blocks.is_empty());
        let data = if blocks.is_empty() {
            debug!(agent = slug, "No blocks parsed, emitting raw response");
            serde_json::Value::String(response.clone())
        } else {
            serde_json::to_value(&blocks)?
        };
        let mut event = StreamEvent::chunk(self.spec.content_kind(), data)
            .with_meta("instruction", request.display_instruction());
        if let Some(other) = &other_content {
            event = event.with_meta("agent_other_message", other.as_str());
        }
        sink.emit(event).await?;

        self.save_blocks(user_id, session_id, &blocks).await;

        info!(user_id, session_id, agent = slug, blocks = blocks.len(), "Subagent finished");
        Ok(AgentOutcome {
            action: self.spec.action,
            blocks,
            response,
            other_content,
            usage,
        })
    }

    async fn build_prompt(&self, request: &AgentRequest) -> String {
        let Some(context) = &self.deps.context else {
            return request.instruction.clone();
        };
        let formatted = context
            .format_context_for_prompt(
                &request.user_id,
                &request.session_id,
                self.spec.slug(),
                PromptSections::default(),
                &request.selections,
            )
            .await;
        if formatted.is_empty() {
            request.instruction.clone()
        } else {
            format!("{}\n\n{formatted}", request.instruction)
        }
    }

    /// One id per block: the context manager's gapless counter when present,
    /// else the persisted note count, else a clock-derived value.
    async fn allocate_ids(&self, user_id: &str, session_id: &str, count: usize) -> Vec<u64> {
        let slug = self.spec.slug();
        if let Some(context) = &self.deps.context {
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(context.next_action_id(user_id, session_id, slug).await);
            }
            return ids;
        }

        if let Some(notes) = &self.deps.notes {
            match notes.count_by_action(user_id, session_id, slug).await {
                Ok(existing) => return (1..=count).map(|k| (existing + k) as u64).collect(),
                Err(e) => self.note_failures.report("count_notes", &e),
            }
        }

        warn!(agent = slug, "No id source available, using clock-derived block ids");
        let base = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_nanos() % 1_000_000) as u64)
            .unwrap_or(0);
        (0..count as u64).map(|k| (base + k) % 1_000_000).collect()
    }

    async fn save_blocks(&self, user_id: &str, session_id: &str, blocks: &[EmittedBlock]) {
        let slug = self.spec.slug();
        for block in blocks {
            if let Some(notes) = &self.deps.notes {
                if let Err(e) = notes
                    .create(user_id, session_id, slug, &block.id, &block.title, &block.content)
                    .await
                {
                    self.note_failures.report("create_note", &e);
                }
            }
            if let Some(context) = &self.deps.context {
                context
                    .add_created_note(user_id, session_id, &block.id, slug, &block.title)
                    .await;
            }
        }
    }

    /// Settle accounting for a stopped run and hand back the stop error.
    async fn finish_stopped(&self, request: &AgentRequest, sink: &dyn EventSink, err: Error) -> Error {
        let (user_id, session_id) = (request.user_id.as_str(), request.session_id.as_str());
        let tokens = &self.deps.tokens;

        if let Some(usage) = self.deps.client.last_usage(user_id, session_id) {
            tokens.add(user_id, session_id, i64::from(usage.total_tokens)).await;
        }
        let summary = tokens.summary(user_id, session_id).await;
        let event = StreamEvent::chunk(
            ContentKind::BillingSummary,
            serde_json::json!({ "total_tokens": summary.total_tokens, "cost": summary.cost }),
        )
        .with_meta("agent", self.spec.slug());
        if let Err(e) = sink.emit(event).await {
            debug!(error = %e, "Billing summary not delivered");
        }
        tokens.cleanup(user_id, session_id).await;

        info!(user_id, session_id, agent = self.spec.slug(), "Subagent stopped");
        err
    }
}

struct SubagentChunks<'a> {
    agent: &'a BaseAgent,
    request: &'a AgentRequest,
    sink: &'a dyn EventSink,
    parser: BlockParser,
    response: String,
    chunks: usize,
}

#[async_trait]
impl<'a> ChunkHandler for SubagentChunks<'a> {
    async fn on_chunk(&mut self, text: &str) -> Result<()> {
        let deps = &self.agent.deps;
        let settings = &self.agent.settings;
        let (user_id, session_id) = (self.request.user_id.as_str(), self.request.session_id.as_str());
        let slug = self.agent.spec.slug();

        self.response.push_str(text);
        self.chunks += 1;

        if self.chunks % settings.stop_check_interval.max(1) == 0 {
            deps.stop.check(user_id, session_id).await?;
        }

        deps.tokens.add(user_id, session_id, estimate_tokens(text)).await;

        if settings.thought_gate.should_emit_thought(text) {
            self.sink
                .emit(StreamEvent::chunk(ContentKind::Thought, text).with_meta("agent", slug))
                .await?;
            deps.metrics.thought_emitted();
        } else {
            deps.metrics.thought_suppressed();
        }

        for block in self.parser.add_chunk(text) {
            debug!(agent = slug, model_id = %block.model_id, "Block completed");
        }
        Ok(())
    }
}
