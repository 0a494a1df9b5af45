//! Per-session mutable context.
//!
//! State lives in process memory behind one mutex per session and is
//! mirrored to `loomi_context:{u}:{s}` after every mutation when a store is
//! configured. The mirror write happens under the session lock, so snapshots
//! land in mutation order. Mirroring is best-effort; a missing store only
//! loses rehydration across processes.

use chrono::{DateTime, Utc};
use loomi_core::message::Message;
use loomi_core::request::SessionKey;
use loomi_store::{DegradeLog, PoolClass, PoolManager};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::notes::NotesService;

/// How many trailing history messages the prompt includes.
const PROMPT_HISTORY_LIMIT: usize = 10;

pub fn context_key(user_id: &str, session_id: &str) -> String {
    format!("loomi_context:{user_id}:{session_id}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedMessage {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// One completed tag from the orchestrator's decision stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorCall {
    pub tag: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Index entry for a block produced in this session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedNote {
    /// Canonical block id, e.g. `insight3`.
    pub id: String,
    pub action: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextState {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub user_message_queue: Vec<TimedMessage>,
    #[serde(default)]
    pub orchestrator_calls: Vec<OrchestratorCall>,
    #[serde(default)]
    pub created_notes: Vec<CreatedNote>,
    #[serde(default)]
    pub global_context: Map<String, Value>,
    #[serde(default)]
    pub agent_contexts: Map<String, Value>,
    #[serde(default)]
    pub shared_memory: Map<String, Value>,
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    /// Raw text of the latest orchestrator decision.
    #[serde(default)]
    pub orchestrator_buf: Option<String>,
    /// Last id handed out per action slug.
    #[serde(default)]
    pub action_counters: BTreeMap<String, u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextState {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            thread_id: None,
            user_message_queue: Vec::new(),
            orchestrator_calls: Vec::new(),
            created_notes: Vec::new(),
            global_context: Map::new(),
            agent_contexts: Map::new(),
            shared_memory: Map::new(),
            conversation_history: Vec::new(),
            orchestrator_buf: None,
            action_counters: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Created notes of one action, in creation order.
    pub fn notes_for_action<'a>(&'a self, action: &'a str) -> impl Iterator<Item = &'a CreatedNote> + 'a {
        self.created_notes.iter().filter(move |n| n.action == action)
    }

    /// Whether `id` names a created note, a global-context key, or a
    /// shared-memory key.
    pub fn knows_reference(&self, id: &str) -> bool {
        self.created_notes.iter().any(|n| n.id == id)
            || self.global_context.contains_key(id)
            || self.shared_memory.contains_key(id)
    }
}

/// Fields accepted by [`ContextManager::update_context`]. Maps merge by key;
/// history appends.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    pub global_context: Option<Map<String, Value>>,
    pub agent_contexts: Option<Map<String, Value>>,
    pub shared_memory: Option<Map<String, Value>>,
    pub conversation_history: Option<Vec<Message>>,
}

/// Which sections [`ContextManager::format_context_for_prompt`] renders.
#[derive(Debug, Clone, Copy)]
pub struct PromptSections {
    pub system: bool,
    pub history: bool,
    pub notes: bool,
    pub selections: bool,
    pub debug: bool,
}

impl Default for PromptSections {
    fn default() -> Self {
        Self {
            system: true,
            history: true,
            notes: true,
            selections: true,
            debug: false,
        }
    }
}

pub struct ContextManager {
    states: RwLock<HashMap<SessionKey, Arc<Mutex<ContextState>>>>,
    pools: Option<Arc<PoolManager>>,
    notes: Option<Arc<NotesService>>,
    degraded: DegradeLog,
}

impl ContextManager {
    /// A process-local manager with no mirroring.
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            pools: None,
            notes: None,
            degraded: DegradeLog::new("context_manager"),
        }
    }

    /// Mirror snapshots through the `normal` pool.
    pub fn with_store(mut self, pools: Arc<PoolManager>) -> Self {
        self.pools = Some(pools);
        self
    }

    /// Seed id allocation from persisted notes as well as the in-memory index.
    pub fn with_notes(mut self, notes: Arc<NotesService>) -> Self {
        self.notes = Some(notes);
        self
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Return the session's state, rehydrating from the mirror or allocating
    /// an empty one when the process has none.
    pub async fn create_context(&self, user_id: &str, session_id: &str, thread_id: Option<&str>) -> ContextState {
        let (cell, created) = self.get_or_create(user_id, session_id).await;
        let mut state = cell.lock().await;
        if state.thread_id.is_none() {
            if let Some(thread) = thread_id {
                state.thread_id = Some(thread.to_string());
            }
        }
        if created {
            self.mirror(&state).await;
        }
        state.clone()
    }

    pub async fn get_context(&self, user_id: &str, session_id: &str) -> Option<ContextState> {
        let cell = self.lookup(user_id, session_id).await?;
        let state = cell.lock().await;
        Some(state.clone())
    }

    /// Drop the in-process state and its mirror.
    pub async fn clear_context(&self, user_id: &str, session_id: &str) {
        self.states
            .write()
            .await
            .remove(&SessionKey::new(user_id, session_id));

        if let Some(pools) = &self.pools {
            let result = match pools.acquire(PoolClass::Normal).await {
                Ok(client) => client.del(&[context_key(user_id, session_id)]).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.degraded.report("clear", &e);
            }
        }
    }

    /// Drop in-process state untouched for `max_idle`. Cells in use are
    /// kept. A mirrored session rehydrates on its next access.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, cell| {
            if Arc::strong_count(cell) > 1 {
                return true;
            }
            match cell.try_lock() {
                Ok(state) => !(now - state.updated_at).to_std().is_ok_and(|age| age >= max_idle),
                Err(_) => true,
            }
        });
        let evicted = before - states.len();
        if evicted > 0 {
            debug!(evicted, remaining = states.len(), "Evicted idle session contexts");
        }
        evicted
    }

    /// Sessions currently held in process memory.
    pub async fn resident_sessions(&self) -> usize {
        self.states.read().await.len()
    }

    // ── Mutations ─────────────────────────────────────────────────────

    pub async fn update_context(&self, user_id: &str, session_id: &str, update: ContextUpdate) {
        self.mutate(user_id, session_id, move |state| {
            if let Some(global) = update.global_context {
                state.global_context.extend(global);
            }
            if let Some(agents) = update.agent_contexts {
                state.agent_contexts.extend(agents);
            }
            if let Some(shared) = update.shared_memory {
                state.shared_memory.extend(shared);
            }
            if let Some(history) = update.conversation_history {
                state.conversation_history.extend(history);
            }
        })
        .await;
    }

    pub async fn add_user_message(&self, user_id: &str, session_id: &str, content: &str) {
        let message = TimedMessage {
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        self.mutate(user_id, session_id, move |state| state.user_message_queue.push(message))
            .await;
    }

    pub async fn add_orchestrator_call(&self, user_id: &str, session_id: &str, tag: &str, content: &str) {
        let call = OrchestratorCall {
            tag: tag.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        self.mutate(user_id, session_id, move |state| state.orchestrator_calls.push(call))
            .await;
    }

    pub async fn add_created_note(&self, user_id: &str, session_id: &str, id: &str, action: &str, title: &str) {
        let note = CreatedNote {
            id: id.to_string(),
            action: action.to_string(),
            title: title.to_string(),
            timestamp: Utc::now(),
        };
        self.mutate(user_id, session_id, move |state| state.created_notes.push(note))
            .await;
    }

    /// Keep the raw decision text alongside the session.
    pub async fn record_orchestrator_buf(&self, user_id: &str, session_id: &str, buf: &str) {
        let buf = buf.to_string();
        self.mutate(user_id, session_id, move |state| state.orchestrator_buf = Some(buf))
            .await;
    }

    /// Allocate the next block id for `action`: strictly increasing from 1
    /// with no gaps for the life of the process.
    ///
    /// The first allocation for an action is seeded from the notes already
    /// known for it, so ids continue after a rehydrated or persisted session.
    pub async fn next_action_id(&self, user_id: &str, session_id: &str, action: &str) -> u64 {
        let (cell, _) = self.get_or_create(user_id, session_id).await;
        let mut state = cell.lock().await;
        if !state.action_counters.contains_key(action) {
            let indexed = state.notes_for_action(action).count() as u64;
            let persisted = match &self.notes {
                Some(notes) => match notes.count_by_action(user_id, session_id, action).await {
                    Ok(n) => n as u64,
                    Err(e) => {
                        self.degraded.report("count_notes", &e);
                        0
                    }
                },
                None => 0,
            };
            state.action_counters.insert(action.to_string(), indexed.max(persisted));
        }
        let counter = state.action_counters.entry(action.to_string()).or_insert(0);
        *counter += 1;
        let id = *counter;
        state.updated_at = Utc::now();
        self.mirror(&state).await;
        id
    }

    // ── Prompt assembly ───────────────────────────────────────────────

    /// Render the session context as prompt text. Sections appear in a fixed
    /// order and empty ones are omitted.
    pub async fn format_context_for_prompt(
        &self,
        user_id: &str,
        session_id: &str,
        agent: &str,
        sections: PromptSections,
        selections: &[String],
    ) -> String {
        let state = match self.get_context(user_id, session_id).await {
            Some(state) => state,
            None => ContextState::new(user_id, session_id),
        };

        let mut parts: Vec<String> = Vec::new();

        if sections.system {
            parts.push(format!(
                "## System\nuser: {user_id}\nsession: {session_id}\nagent: {agent}\ntime: {}",
                Utc::now().to_rfc3339()
            ));
        }

        if sections.history && !state.conversation_history.is_empty() {
            let start = state.conversation_history.len().saturating_sub(PROMPT_HISTORY_LIMIT);
            let lines: Vec<String> = state.conversation_history[start..]
                .iter()
                .map(|m| format!("- {}: {}", m.role.as_str(), m.content))
                .collect();
            parts.push(format!("## Conversation history\n{}", lines.join("\n")));
        }

        if sections.notes && !state.created_notes.is_empty() {
            let lines: Vec<String> = state
                .created_notes
                .iter()
                .map(|n| format!("- @{} ({}): {}", n.id, n.action, n.title))
                .collect();
            parts.push(format!("## Created notes\n{}", lines.join("\n")));
        }

        if sections.selections && !selections.is_empty() {
            let lines: Vec<String> = selections.iter().map(|s| format!("- {s}")).collect();
            parts.push(format!("## User selections\n{}", lines.join("\n")));
        }

        if !state.global_context.is_empty() {
            parts.push(format!("## Global context\n{}", render_map(&state.global_context)));
        }

        if let Some(agent_ctx) = state.agent_contexts.get(agent) {
            parts.push(format!("## Agent context ({agent})\n{}", render_value(agent_ctx)));
        }

        if !state.shared_memory.is_empty() {
            parts.push(format!("## Shared memory\n{}", render_map(&state.shared_memory)));
        }

        if sections.debug {
            parts.push(format!(
                "## Debug\nmessages: {}\norchestrator calls: {}\nnotes: {}",
                state.user_message_queue.len(),
                state.orchestrator_calls.len(),
                state.created_notes.len()
            ));
        }

        parts.join("\n\n")
    }

    // ── Mirroring ─────────────────────────────────────────────────────

    /// Read a mirrored snapshot back from the store.
    pub async fn load_mirrored(&self, user_id: &str, session_id: &str) -> Option<ContextState> {
        let pools = self.pools.as_ref()?;
        let client = match pools.acquire(PoolClass::Normal).await {
            Ok(client) => client,
            Err(e) => {
                self.degraded.report("load_mirrored", &e);
                return None;
            }
        };
        let raw = match client.get(&context_key(user_id, session_id)).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.degraded.report("load_mirrored", &e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                debug!(user_id, session_id, error = %e, "Ignoring unreadable context mirror");
                None
            }
        }
    }

    async fn mirror(&self, state: &ContextState) {
        let Some(pools) = &self.pools else {
            return;
        };
        let json = match serde_json::to_string(state) {
            Ok(json) => json,
            Err(e) => {
                debug!(error = %e, "Context snapshot not serializable");
                return;
            }
        };
        let result = match pools.acquire(PoolClass::Normal).await {
            Ok(client) => {
                client
                    .set(&context_key(&state.user_id, &state.session_id), &json, None)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.degraded.report("mirror", &e);
        }
    }

    // ── Internals ─────────────────────────────────────────────────────

    async fn lookup(&self, user_id: &str, session_id: &str) -> Option<Arc<Mutex<ContextState>>> {
        self.states
            .read()
            .await
            .get(&SessionKey::new(user_id, session_id))
            .cloned()
    }

    /// The session cell, and whether it was freshly allocated (not rehydrated).
    async fn get_or_create(&self, user_id: &str, session_id: &str) -> (Arc<Mutex<ContextState>>, bool) {
        if let Some(cell) = self.lookup(user_id, session_id).await {
            return (cell, false);
        }

        let mirrored = self.load_mirrored(user_id, session_id).await;
        let fresh = mirrored.is_none();
        let state = mirrored.unwrap_or_else(|| ContextState::new(user_id, session_id));

        let mut states = self.states.write().await;
        // Another task may have won the race while we loaded
        if let Some(cell) = states.get(&SessionKey::new(user_id, session_id)) {
            return (cell.clone(), false);
        }
        let cell = Arc::new(Mutex::new(state));
        states.insert(SessionKey::new(user_id, session_id), cell.clone());
        (cell, fresh)
    }

    async fn mutate<F>(&self, user_id: &str, session_id: &str, apply: F)
    where
        F: FnOnce(&mut ContextState),
    {
        let (cell, _) = self.get_or_create(user_id, session_id).await;
        let mut state = cell.lock().await;
        apply(&mut state);
        state.updated_at = Utc::now();
        self.mirror(&state).await;
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

fn render_map(map: &Map<String, Value>) -> String {
    map.iter()
        .map(|(k, v)| format!("- {k}: {}", render_value(v)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
