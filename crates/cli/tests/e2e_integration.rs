//! End-to-end integration tests for the loomi runtime.
//!
//! These tests wire a full [`Runtime`] over in-memory backends and a scripted
//! model client, then drive whole orchestrations: decision, fan-out, block
//! parsing, note persistence, stop propagation and thought throttling.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use loomi_agent::{Runtime, resolve_references};
use loomi_config::AppConfig;
use loomi_core::error::ProviderError;
use loomi_core::event::{ContentKind, EventSink, StreamEvent};
use loomi_core::provider::{ChunkReceiver, ModelClient, ModelRequest, StreamChunk, Usage};
use loomi_core::request::AgentRequest;
use loomi_session::{ContextState, CreatedNote, StopManager};
use loomi_store::{InMemoryKv, NoopKv, PoolManager};
use tokio::sync::mpsc;

// ── Scripted Model Client ────────────────────────────────────────────────

const ORCHESTRATOR: &str = "<Action type=";
const KNOWLEDGE: &str = "market knowledge analyst";
const PERSONA: &str = "audience researcher";
const CONTENT_ANALYSIS: &str = "You analyze existing content";

/// Replies per system-prompt marker, chunk by chunk.
struct ScriptedClient {
    routes: Vec<(&'static str, Vec<String>)>,
    chunk_delay: Option<Duration>,
    /// Request a stop for the calling session right after the first chunk.
    stop_after_first_chunk: Mutex<Option<Arc<StopManager>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new() -> Self {
        Self {
            routes: Vec::new(),
            chunk_delay: None,
            stop_after_first_chunk: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn route(mut self, marker: &'static str, chunks: Vec<String>) -> Self {
        self.routes.push((marker, chunks));
        self
    }

    fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    fn stop_after_first_chunk(&self, stop: Arc<StopManager>) {
        *self.stop_after_first_chunk.lock().unwrap() = Some(stop);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn name(&self) -> &str {
        "e2e_scripted"
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        let system = request.messages[0].content.clone();
        let (marker, chunks) = self
            .routes
            .iter()
            .find(|(marker, _)| system.contains(marker))
            .cloned()
            .unwrap_or_else(|| panic!("no scripted reply for system prompt {system:?}"));
        self.calls.lock().unwrap().push(marker.to_string());

        let stop = self.stop_after_first_chunk.lock().unwrap().take();
        let delay = self.chunk_delay;
        let (user_id, session_id) = (request.user_id.clone(), request.session_id.clone());

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(StreamChunk::text(chunk))).await.is_err() {
                    return;
                }
                if i == 0 {
                    if let Some(stop) = &stop {
                        stop.request_stop(&user_id, &session_id).await;
                    }
                }
            }
            let _ = tx
                .send(Ok(StreamChunk::finished(Some(Usage::new(100, 50)))))
                .await;
        });
        Ok(rx)
    }
}

fn chunks_of(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

fn runtime_over(client: Arc<ScriptedClient>, pools: Arc<PoolManager>) -> Runtime {
    Runtime::with_pools(&AppConfig::default(), client, pools)
}

fn in_memory_runtime(client: Arc<ScriptedClient>) -> Runtime {
    runtime_over(
        client,
        Arc::new(PoolManager::with_defaults(Arc::new(InMemoryKv::new()))),
    )
}

async fn orchestrate(
    runtime: &Runtime,
    request: &AgentRequest,
) -> (loomi_core::Result<loomi_agent::OrchestrationReport>, Vec<StreamEvent>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = Arc::new(tx);
    let result = runtime.orchestrator.run(request, sink).await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (result, events)
}

fn events_of(events: &[StreamEvent], kind: ContentKind) -> Vec<&StreamEvent> {
    events.iter().filter(|e| e.content_type == kind).collect()
}

// ── Scenario 1: Happy-Path Fan-Out ───────────────────────────────────────

#[tokio::test]
async fn happy_path_fan_out() {
    let decision = r#"<think>Need facts and an audience.</think><Action type="knowledge">Q1</Action><Action type="persona">Q2</Action>"#;
    let client = Arc::new(
        ScriptedClient::new()
            .route(ORCHESTRATOR, chunks_of(decision, 7))
            .route(
                KNOWLEDGE,
                chunks_of("<knowledge1><title>Category</title>Skincare is growing.</knowledge1>", 9),
            )
            .route(
                PERSONA,
                chunks_of("<persona1><title>Students</title>Budget conscious.</persona1>", 9),
            ),
    );
    let runtime = in_memory_runtime(client.clone());

    let request = AgentRequest::new("u1", "s1", "plan a post on X");
    let (result, events) = orchestrate(&runtime, &request).await;
    let report = result.unwrap();
    assert_eq!(report.actions.len(), 2);
    assert_eq!(report.outcomes.len(), 2);

    let knowledge = events_of(&events, ContentKind::Knowledge);
    assert_eq!(knowledge.len(), 1);
    assert_eq!(knowledge[0].data[0]["id"], "knowledge1");
    assert_eq!(knowledge[0].data[0]["title"], "Category");

    let persona = events_of(&events, ContentKind::Persona);
    assert_eq!(persona.len(), 1);
    assert_eq!(persona[0].data[0]["id"], "persona1");

    let notes = runtime.notes.list_session("u1", "s1").await.unwrap();
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|n| n.select_flag == 1));

    let summary = events.last().unwrap();
    assert_eq!(summary.content_type, ContentKind::OrchestratorMessage);
    assert!(summary.data["total_tokens"].as_i64().unwrap() > 0);

    let context = runtime.context.get_context("u1", "s1").await.unwrap();
    assert_eq!(context.created_notes.len(), 2);
    assert_eq!(client.calls().len(), 3);
}

// ── Scenario 2: Empty Plan ───────────────────────────────────────────────

#[tokio::test]
async fn empty_plan_emits_only_summary() {
    let client = Arc::new(ScriptedClient::new().route(
        ORCHESTRATOR,
        chunks_of("<think>Nothing to delegate.</think>Just say hello.", 8),
    ));
    let runtime = in_memory_runtime(client.clone());

    let (result, events) = orchestrate(&runtime, &AgentRequest::new("u1", "s1", "hi")).await;
    let report = result.unwrap();
    assert!(report.actions.is_empty());

    let summaries = events_of(&events, ContentKind::OrchestratorMessage);
    assert_eq!(summaries.len(), 1);
    assert!(events.iter().all(|e| matches!(
        e.content_type,
        ContentKind::Thought | ContentKind::OrchestratorMessage
    )));
    assert_eq!(client.calls(), vec![ORCHESTRATOR.to_string()]);
}

// ── Scenario 3: Mid-Stream Stop ──────────────────────────────────────────

#[tokio::test]
async fn stop_during_decision_prevents_fan_out() {
    let decision = r#"<Action type="knowledge">Q1</Action><Action type="persona">Q2</Action>"#;
    let client = Arc::new(
        ScriptedClient::new()
            .route(ORCHESTRATOR, chunks_of(decision, 3))
            .route(KNOWLEDGE, vec!["<knowledge1>x</knowledge1>".into()])
            .route(PERSONA, vec!["<persona1>x</persona1>".into()]),
    );
    let runtime = in_memory_runtime(client.clone());
    client.stop_after_first_chunk(runtime.stop.clone());

    let (result, events) = orchestrate(&runtime, &AgentRequest::new("u1", "s1", "plan")).await;
    assert!(result.unwrap_err().is_stopped());

    assert!(events_of(&events, ContentKind::Knowledge).is_empty());
    assert!(events_of(&events, ContentKind::Persona).is_empty());
    assert_eq!(client.calls(), vec![ORCHESTRATOR.to_string()]);

    let snapshot = runtime.metrics.snapshot();
    assert_eq!(snapshot.subagents_started, 0);
    assert_eq!(snapshot.active_subagents, 0);
    assert_eq!(snapshot.requests_stopped, 1);
}

#[tokio::test]
async fn stop_is_self_healing_after_ttl() {
    let client = Arc::new(ScriptedClient::new().route(ORCHESTRATOR, vec!["ok".into()]));
    let runtime = in_memory_runtime(client);

    // A stopper that never saw a run through leaves its flag behind
    tokio::time::pause();
    runtime.stop.request_stop("u1", "s1").await;
    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(runtime.stop.is_stopped("u1", "s1").await);

    tokio::time::advance(Duration::from_secs(2)).await;
    let (result, _) = orchestrate(&runtime, &AgentRequest::new("u1", "s1", "plan")).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn stopped_run_consumes_the_flag() {
    let client = Arc::new(ScriptedClient::new().route(ORCHESTRATOR, vec!["ok".into()]));
    let runtime = in_memory_runtime(client);

    runtime.stop.request_stop("u1", "s1").await;
    let (result, events) = orchestrate(&runtime, &AgentRequest::new("u1", "s1", "plan")).await;
    assert!(result.unwrap_err().is_stopped());
    assert!(events_of(&events, ContentKind::OrchestratorMessage).is_empty());

    assert!(!runtime.stop.is_stopped("u1", "s1").await);
    let (result, _) = orchestrate(&runtime, &AgentRequest::new("u1", "s1", "plan")).await;
    assert!(result.is_ok());
}

// ── Scenario 4: Parse-Failure Fallback ───────────────────────────────────

#[tokio::test]
async fn free_text_subagent_output_falls_back_to_raw() {
    let raw = "The account posts at night and leans on before/after photos.";
    let client = Arc::new(
        ScriptedClient::new()
            .route(
                ORCHESTRATOR,
                chunks_of(r#"<Action type="content_analysis">review the account</Action>"#, 10),
            )
            .route(CONTENT_ANALYSIS, chunks_of(raw, 12)),
    );
    let runtime = in_memory_runtime(client);

    let (result, events) = orchestrate(&runtime, &AgentRequest::new("u1", "s1", "analyze")).await;
    result.unwrap();

    let analysis = events_of(&events, ContentKind::ContentAnalysis);
    assert_eq!(analysis.len(), 1);
    assert_eq!(analysis[0].data, serde_json::json!(raw));
    assert!(analysis[0].meta_value("agent_other_message").is_none());

    let notes = runtime.notes.get_by_action("u1", "s1", "content_analysis").await.unwrap();
    assert!(notes.is_empty());
}

// ── Scenario 5: Reference Resolution ─────────────────────────────────────

fn state_with(ids: &[&str]) -> ContextState {
    let mut state = ContextState::new("u1", "s1");
    state.created_notes = ids
        .iter()
        .map(|id| CreatedNote {
            id: id.to_string(),
            action: String::new(),
            title: String::new(),
            timestamp: chrono::Utc::now(),
        })
        .collect();
    state
}

#[test]
fn references_resolve_against_created_notes() {
    let state = state_with(&["insight1", "insight2", "insight3"]);
    assert_eq!(resolve_references("第三个洞察", &state), vec!["@insight3"]);
    assert_eq!(resolve_references("最新的", &state), vec!["@insight3"]);

    let state = state_with(&["insight1", "profile1", "profile2"]);
    assert_eq!(
        resolve_references("@file1 和 第二个画像", &state),
        vec!["@file1", "@profile2"]
    );
}

#[tokio::test]
async fn second_request_references_first_requests_blocks() {
    let client = Arc::new(
        ScriptedClient::new()
            .route(ORCHESTRATOR, chunks_of(r#"<Action type="persona">who</Action>"#, 6))
            .route(
                PERSONA,
                chunks_of("<persona1><title>A</title>a</persona1><persona2><title>B</title>b</persona2>", 11),
            ),
    );
    let runtime = in_memory_runtime(client.clone());

    orchestrate(&runtime, &AgentRequest::new("u1", "s1", "find the audience"))
        .await
        .0
        .unwrap();
    orchestrate(&runtime, &AgentRequest::new("u1", "s1", "refine persona1"))
        .await
        .0
        .unwrap();

    let notes = runtime.notes.get_by_action("u1", "s1", "persona").await.unwrap();
    let names: Vec<&str> = notes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["persona1", "persona2", "persona3", "persona4"]);

    let context = runtime.context.get_context("u1", "s1").await.unwrap();
    assert_eq!(
        resolve_references("compare @persona1 and @persona4", &context),
        vec!["@persona1", "@persona4"]
    );
    assert!(resolve_references("@persona5", &context).is_empty());
}

// ── Scenario 6: Thought Throttle ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn orchestrator_thoughts_are_throttled() {
    let chunk = "x".repeat(50);
    let client = Arc::new(
        ScriptedClient::new()
            .route(ORCHESTRATOR, vec![chunk; 100])
            .with_chunk_delay(Duration::from_millis(20)),
    );
    let runtime = in_memory_runtime(client);

    let started = tokio::time::Instant::now();
    let (result, events) = orchestrate(&runtime, &AgentRequest::new("u1", "s1", "think")).await;
    result.unwrap();
    assert!(started.elapsed() <= Duration::from_secs(3));

    let thoughts: Vec<&StreamEvent> = events_of(&events, ContentKind::Thought)
        .into_iter()
        .filter(|e| e.meta_value("agent") == Some(&serde_json::json!("orchestrator")))
        .collect();
    assert_eq!(thoughts.len(), 1);
    assert_eq!(thoughts[0].data, serde_json::json!("x".repeat(50)));

    let snapshot = runtime.metrics.snapshot();
    assert_eq!(snapshot.thoughts_emitted, 1);
    assert_eq!(snapshot.thoughts_suppressed, 99);
}

// ── Degraded Store ───────────────────────────────────────────────────────

#[tokio::test]
async fn unavailable_store_does_not_affect_the_stream() {
    let client = Arc::new(
        ScriptedClient::new()
            .route(ORCHESTRATOR, chunks_of(r#"<Action type="knowledge">Q</Action>"#, 5))
            .route(KNOWLEDGE, chunks_of("<knowledge1><title>T</title>body</knowledge1>", 8)),
    );
    let runtime = runtime_over(client, Arc::new(PoolManager::with_defaults(Arc::new(NoopKv))));

    let (result, events) = orchestrate(&runtime, &AgentRequest::new("u1", "s1", "plan")).await;
    result.unwrap();

    let knowledge = events_of(&events, ContentKind::Knowledge);
    assert_eq!(knowledge.len(), 1);
    assert_eq!(knowledge[0].data[0]["id"], "knowledge1");
    assert_eq!(
        events.last().unwrap().content_type,
        ContentKind::OrchestratorMessage
    );
}
