//! Chat sessions and their persisted turns.
//!
//! Each session owns its conversation history plus the per-session state
//! the pipeline consults when a question is asked: mode flags, output
//! target, model selection, and the mentioned-file cache.

use crate::context::ContextCache;
use crate::util::truncate;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 40;

/// One completed question/response exchange. Created only when a turn
/// finishes (successfully or with a terminal failure); never mutated
/// afterwards except by user-initiated deletion.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub key: Uuid,
    pub question: String,
    pub response: String,
    pub snippet: Option<String>,
    pub agent_mode: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: u64,
    pub title: String,
    pub turns: Vec<ChatTurn>,
    pub agent_mode: bool,
    pub write_to_file: bool,
    pub output_file: String,
    pub model_index: usize,
    pub context: ContextCache,
    /// Editor-selection text attached to the next question
    pub snippet: String,
}

impl Session {
    fn new(id: u64, context_capacity: usize) -> Self {
        Self {
            id,
            title: DEFAULT_TITLE.to_string(),
            turns: Vec::new(),
            agent_mode: false,
            write_to_file: false,
            output_file: "output".to_string(),
            model_index: 0,
            context: ContextCache::new(context_capacity),
            snippet: String::new(),
        }
    }

    /// Title an untitled session after its first question.
    pub fn set_title_from(&mut self, question: &str) {
        if self.title == DEFAULT_TITLE {
            let line = question.lines().next().unwrap_or(question);
            self.title = truncate(line.trim(), TITLE_MAX_CHARS);
        }
    }

    /// Remove one turn by key; unknown keys are a no-op.
    pub fn delete_turn(&mut self, key: Uuid) -> bool {
        let before = self.turns.len();
        self.turns.retain(|t| t.key != key);
        self.turns.len() != before
    }
}

/// All sessions plus the active selection. There is always at least one
/// session.
#[derive(Debug)]
pub struct SessionStore {
    sessions: BTreeMap<u64, Session>,
    current: u64,
    next_id: u64,
}

impl SessionStore {
    pub fn new(context_capacity: usize) -> Self {
        let mut store = Self {
            sessions: BTreeMap::new(),
            current: 0,
            next_id: 0,
        };
        store.new_session(context_capacity);
        store
    }

    pub fn current_id(&self) -> u64 {
        self.current
    }

    pub fn current(&self) -> &Session {
        self.sessions
            .get(&self.current)
            .expect("store always holds the current session")
    }

    pub fn current_mut(&mut self) -> &mut Session {
        self.sessions
            .get_mut(&self.current)
            .expect("store always holds the current session")
    }

    /// Create a fresh session and switch to it.
    pub fn new_session(&mut self, context_capacity: usize) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, Session::new(id, context_capacity));
        self.current = id;
        id
    }

    /// Switch the active session. Unknown ids are refused.
    pub fn switch(&mut self, id: u64) -> bool {
        if self.sessions.contains_key(&id) {
            self.current = id;
            true
        } else {
            false
        }
    }

    /// Delete a session. Deleting the last one replaces it with a fresh
    /// session; deleting the active one switches to the oldest remaining.
    pub fn delete(&mut self, id: u64, context_capacity: usize) -> bool {
        if self.sessions.remove(&id).is_none() {
            return false;
        }
        if self.sessions.is_empty() {
            self.new_session(context_capacity);
        } else if self.current == id {
            let first = *self
                .sessions
                .keys()
                .next()
                .expect("non-empty after removal");
            self.current = first;
        }
        true
    }

    /// Session ids and titles, newest first.
    pub fn titles(&self) -> Vec<(u64, String)> {
        self.sessions
            .iter()
            .rev()
            .map(|(id, s)| (*id, s.title.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_starts_with_one_session() {
        let store = SessionStore::new(3);
        assert_eq!(store.len(), 1);
        assert_eq!(store.current().title, "New Chat");
    }

    #[test]
    fn test_title_set_once_from_first_question() {
        let mut store = SessionStore::new(3);
        store
            .current_mut()
            .set_title_from("How do I parse JSON in Python without external packages?");
        let title = store.current().title.clone();
        assert!(title.starts_with("How do I parse JSON"));
        assert!(title.chars().count() <= 40);

        store.current_mut().set_title_from("second question");
        assert_eq!(store.current().title, title);
    }

    #[test]
    fn test_switch_and_delete() {
        let mut store = SessionStore::new(3);
        let first = store.current_id();
        let second = store.new_session(3);
        assert_eq!(store.current_id(), second);

        assert!(store.switch(first));
        assert_eq!(store.current_id(), first);
        assert!(!store.switch(999));

        // Deleting the active session falls back to the oldest remaining
        assert!(store.delete(first, 3));
        assert_eq!(store.current_id(), second);

        // Deleting the last session replaces it with a fresh one
        assert!(store.delete(second, 3));
        assert_eq!(store.len(), 1);
        assert_eq!(store.current().title, "New Chat");
    }

    #[test]
    fn test_delete_turn() {
        let mut store = SessionStore::new(3);
        let key = Uuid::new_v4();
        store.current_mut().turns.push(ChatTurn {
            key,
            question: "q".into(),
            response: "r".into(),
            snippet: None,
            agent_mode: false,
            created_at: Utc::now(),
        });
        assert!(store.current_mut().delete_turn(key));
        assert!(!store.current_mut().delete_turn(key));
        assert!(store.current().turns.is_empty());
    }
}
