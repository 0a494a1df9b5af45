//! In-memory notes backend.

use async_trait::async_trait;
use loomi_core::error::StoreError;
use loomi_core::notes::{Note, NotesBackend};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Stores notes in an append-only Vec, which keeps insertion order for every
/// (user, session, action) slice.
pub struct InMemoryNotes {
    notes: Arc<RwLock<Vec<Note>>>,
}

impl InMemoryNotes {
    pub fn new() -> Self {
        Self {
            notes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn count(&self) -> usize {
        self.notes.read().await.len()
    }
}

impl Default for InMemoryNotes {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotesBackend for InMemoryNotes {
    fn name(&self) -> &str { "in_memory" }

    async fn create(&self, mut note: Note) -> Result<String, StoreError> {
        if note.id.is_empty() {
            note.id = Uuid::new_v4().to_string();
        }
        let id = note.id.clone();
        self.notes.write().await.push(note);
        Ok(id)
    }

    async fn list_by_action(
        &self,
        user_id: &str,
        session_id: &str,
        action: &str,
    ) -> Result<Vec<Note>, StoreError> {
        let notes = self.notes.read().await;
        Ok(notes
            .iter()
            .filter(|n| n.user_id == user_id && n.session_id == session_id && n.action == action)
            .cloned()
            .collect())
    }

    async fn list_session(&self, user_id: &str, session_id: &str) -> Result<Vec<Note>, StoreError> {
        let notes = self.notes.read().await;
        Ok(notes
            .iter()
            .filter(|n| n.user_id == user_id && n.session_id == session_id)
            .cloned()
            .collect())
    }
}
