//! Note creation over a pluggable [`NotesBackend`].

use chrono::Utc;
use loomi_core::action::select_flag_for_slug;
use loomi_core::error::StoreError;
use loomi_core::notes::{Note, NotesBackend};
use std::sync::Arc;
use tracing::debug;

/// Append-only note records keyed by (user, session, action).
pub struct NotesService {
    backend: Arc<dyn NotesBackend>,
}

impl NotesService {
    pub fn new(backend: Arc<dyn NotesBackend>) -> Self {
        Self { backend }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Persist one block. The select flag is derived from the action slug.
    pub async fn create(
        &self,
        user_id: &str,
        session_id: &str,
        action: &str,
        name: &str,
        title: &str,
        content: &str,
    ) -> Result<String, StoreError> {
        let note = Note {
            id: String::new(),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            action: action.to_string(),
            name: name.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            select_flag: select_flag_for_slug(action),
            created_at: Utc::now(),
        };
        let id = self.backend.create(note).await?;
        debug!(user_id, session_id, action, name, note_id = %id, "Note created");
        Ok(id)
    }

    pub async fn get_by_action(
        &self,
        user_id: &str,
        session_id: &str,
        action: &str,
    ) -> Result<Vec<Note>, StoreError> {
        self.backend.list_by_action(user_id, session_id, action).await
    }

    pub async fn list_session(&self, user_id: &str, session_id: &str) -> Result<Vec<Note>, StoreError> {
        self.backend.list_session(user_id, session_id).await
    }

    pub async fn count_by_action(
        &self,
        user_id: &str,
        session_id: &str,
        action: &str,
    ) -> Result<usize, StoreError> {
        Ok(self.get_by_action(user_id, session_id, action).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loomi_store::InMemoryNotes;

    #[tokio::test]
    async fn select_flag_follows_action_table() {
        let notes = NotesService::new(Arc::new(InMemoryNotes::new()));
        notes.create("u1", "s1", "knowledge", "knowledge1", "T", "C").await.unwrap();
        notes.create("u1", "s1", "xhs_post", "xhs_post1", "T", "C").await.unwrap();
        notes.create("u1", "s1", "mystery", "mystery1", "T", "C").await.unwrap();

        let all = notes.list_session("u1", "s1").await.unwrap();
        let flags: Vec<u8> = all.iter().map(|n| n.select_flag).collect();
        assert_eq!(flags, vec![1, 0, 0]);
    }

    #[tokio::test]
    async fn count_by_action_filters() {
        let notes = NotesService::new(Arc::new(InMemoryNotes::new()));
        notes.create("u1", "s1", "persona", "persona1", "A", "x").await.unwrap();
        notes.create("u1", "s1", "persona", "persona2", "B", "y").await.unwrap();
        notes.create("u1", "s1", "knowledge", "knowledge1", "C", "z").await.unwrap();

        assert_eq!(notes.count_by_action("u1", "s1", "persona").await.unwrap(), 2);
        let personas = notes.get_by_action("u1", "s1", "persona").await.unwrap();
        assert_eq!(personas[0].title, "A");
        assert_eq!(personas[1].title, "B");
    }
}
