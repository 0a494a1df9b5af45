//! Inbound request types: session identity, agent requests, action items.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::action::ActionKind;

/// Separator between the model-facing preamble and the display instruction.
pub const DISPLAY_SEPARATOR: &str = "||";

/// Identity of a session: every piece of per-session state is keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.session_id)
    }
}

/// A request entering the runtime (orchestrator or a single subagent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Full instruction text sent to the model.
    pub instruction: String,

    pub user_id: String,

    pub session_id: String,

    #[serde(default)]
    pub use_files: bool,

    #[serde(default)]
    pub file_ids: Vec<String>,

    #[serde(default)]
    pub auto_mode: bool,

    /// Prior user-selected artifact references (`@insight2`, "第二个画像", ...).
    #[serde(default)]
    pub selections: Vec<String>,
}

impl AgentRequest {
    pub fn new(
        user_id: impl Into<String>,
        session_id: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            instruction: instruction.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    pub fn with_selections(mut self, selections: Vec<String>) -> Self {
        self.selections = selections;
        self
    }

    pub fn session(&self) -> SessionKey {
        SessionKey::new(&self.user_id, &self.session_id)
    }

    /// The text after the last `||`, or the whole instruction.
    pub fn display_instruction(&self) -> &str {
        display_instruction(&self.instruction)
    }

    /// Derive a subagent request carrying this request's identity.
    pub fn for_action(&self, instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            ..self.clone()
        }
    }
}

/// The substring after the last `||`, trimmed; the full text when absent.
pub fn display_instruction(instruction: &str) -> &str {
    match instruction.rfind(DISPLAY_SEPARATOR) {
        Some(idx) => instruction[idx + DISPLAY_SEPARATOR.len()..].trim(),
        None => instruction,
    }
}

/// One orchestrator decision: dispatch `instruction` to the `kind` subagent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub action_type: ActionKind,
    pub instruction: String,
}
