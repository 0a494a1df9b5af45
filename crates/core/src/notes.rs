//! Notes: persisted structured blocks keyed by (user, session, action).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A persisted block record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// Storage identifier (assigned by the backend when empty).
    pub id: String,

    pub user_id: String,

    pub session_id: String,

    /// The producing action slug.
    pub action: String,

    /// Canonical block id, e.g. `knowledge3`.
    pub name: String,

    pub title: String,

    pub content: String,

    /// 1 = auto-selected artifact, 0 = user-selected.
    pub select_flag: u8,

    pub created_at: DateTime<Utc>,
}

/// Storage interface for notes. Implementations must preserve insertion
/// order per (user, session, action).
#[async_trait]
pub trait NotesBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Append a note; returns its storage id.
    async fn create(&self, note: Note) -> std::result::Result<String, StoreError>;

    /// Notes for one action, in insertion order.
    async fn list_by_action(
        &self,
        user_id: &str,
        session_id: &str,
        action: &str,
    ) -> std::result::Result<Vec<Note>, StoreError>;

    /// Every note of a session, in insertion order.
    async fn list_session(&self, user_id: &str, session_id: &str) -> std::result::Result<Vec<Note>, StoreError>;
}
