//! Shared fixtures for agent tests.

use async_trait::async_trait;
use loomi_core::error::ProviderError;
use loomi_core::event::StreamEvent;
use loomi_core::provider::{ChunkReceiver, ModelClient, ModelRequest, StreamChunk, Usage};
use loomi_session::{ContextManager, NotesService};
use loomi_store::{InMemoryKv, InMemoryNotes, PoolManager};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::agent_loop::AgentDeps;

enum Reply {
    Chunks(Vec<String>),
    Fail,
}

struct Route {
    marker: String,
    reply: Reply,
}

/// A model client that answers from a script, picking the reply whose marker
/// appears in the request's system prompt. Routing by prompt keeps concurrent
/// subagents deterministic.
pub struct ScriptedClient {
    routes: Vec<Route>,
    chunk_delay: Option<Duration>,
    usage: Option<Usage>,
    thinking: bool,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            chunk_delay: None,
            usage: None,
            thinking: false,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `text` split into `chunk_chars`-character chunks.
    pub fn route(self, marker: &str, text: &str, chunk_chars: usize) -> Self {
        self.route_chunks(marker, split_chunks(text, chunk_chars))
    }

    pub fn route_chunks(mut self, marker: &str, chunks: Vec<String>) -> Self {
        self.routes.push(Route {
            marker: marker.to_string(),
            reply: Reply::Chunks(chunks),
        });
        self
    }

    /// Fail requests matching `marker` with a 502.
    pub fn route_failure(mut self, marker: &str) -> Self {
        self.routes.push(Route {
            marker: marker.to_string(),
            reply: Reply::Fail,
        });
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Advertise reasoning-budget support.
    pub fn with_thinking(mut self) -> Self {
        self.thinking = true;
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        let system = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.requests.lock().unwrap().push(request);

        let route = self
            .routes
            .iter()
            .find(|r| system.contains(&r.marker))
            .unwrap_or_else(|| panic!("ScriptedClient: no route for system prompt {system:?}"));

        let chunks = match &route.reply {
            Reply::Chunks(chunks) => chunks.clone(),
            Reply::Fail => {
                return Err(ProviderError::ApiError {
                    status_code: 502,
                    message: "scripted failure".into(),
                });
            }
        };

        let (tx, rx) = mpsc::channel(4);
        let delay = self.chunk_delay;
        let usage = self.usage;
        tokio::spawn(async move {
            for chunk in chunks {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(StreamChunk::text(chunk))).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(StreamChunk::finished(usage))).await;
        });
        Ok(rx)
    }

    fn last_usage(&self, _user_id: &str, _session_id: &str) -> Option<Usage> {
        self.usage
    }

    fn supports_thinking(&self) -> bool {
        self.thinking
    }
}

pub fn split_chunks(text: &str, chunk_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_chars.max(1))
        .map(|c| c.iter().collect())
        .collect()
}

/// In-memory wiring for one test.
pub struct TestRig {
    pub pools: Arc<PoolManager>,
    pub notes_backend: Arc<InMemoryNotes>,
    pub notes: Arc<NotesService>,
    pub context: Arc<ContextManager>,
    pub deps: AgentDeps,
}

pub fn rig(client: Arc<dyn ModelClient>) -> TestRig {
    let pools = Arc::new(PoolManager::with_defaults(Arc::new(InMemoryKv::new())));
    let notes_backend = Arc::new(InMemoryNotes::new());
    let notes = Arc::new(NotesService::new(notes_backend.clone()));
    let context = Arc::new(
        ContextManager::new()
            .with_store(pools.clone())
            .with_notes(notes.clone()),
    );
    let deps = AgentDeps::new(client, pools.clone())
        .with_context(context.clone())
        .with_notes(notes.clone());
    TestRig {
        pools,
        notes_backend,
        notes,
        context,
        deps,
    }
}

/// Drain everything already sent on an event channel.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
