//! Event-sourced, per-directory state store.
//!
//! [`DirectoryStore`] is the single writer of synchronized state: only
//! [`DirectoryStore::handle_event`], [`DirectoryStore::handle_sse_event`] and
//! the hydration methods take `&mut self`. Whoever owns the store owns the
//! write side; everyone else reads cheap clones.

mod derive;
mod reducer;
mod state;

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use oqto_sync_protocol::{
    GlobalEvent, Message, MessageWithParts, Part, Role, RunState, Session, SyncEvent, Todo,
};

use crate::sorted;

pub use derive::{MAX_OUTPUT_RESERVE, NEAR_LIMIT_PERCENT, context_usage};
pub use state::{
    CompactionProgress, CompactionState, ContextTokens, ContextUsage, DEFAULT_MODEL_LIMITS,
    DirectoryState, ModelLimits, ModelLimitsUpdate,
};

/// Bulk state fetched from a server on (re)connect.
#[derive(Debug, Clone)]
pub enum Hydration {
    Sessions {
        directory: String,
        sessions: Vec<Session>,
    },
    Messages {
        directory: String,
        session_id: String,
        history: Vec<MessageWithParts>,
    },
    ModelLimits {
        directory: String,
        model_id: String,
        update: ModelLimitsUpdate,
    },
}

/// All directories known to this client.
///
/// Cloning is cheap: each directory is an `Arc` and shares every branch with
/// the original until the original is written to.
#[derive(Debug, Clone, Default)]
pub struct DirectoryStore {
    directories: HashMap<String, Arc<DirectoryState>>,
}

impl DirectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the state for `directory` if it does not exist yet.
    ///
    /// Returns `true` if it was created.
    pub fn init_directory(&mut self, directory: &str) -> bool {
        if self.directories.contains_key(directory) {
            return false;
        }
        debug!("Initializing store for directory {}", directory);
        self.directories
            .insert(directory.to_string(), Arc::new(DirectoryState::default()));
        true
    }

    /// Apply an event to an initialized directory.
    ///
    /// Events for unknown directories are ignored; use
    /// [`handle_sse_event`](Self::handle_sse_event) to create them on demand.
    /// Returns whether anything changed.
    pub fn handle_event(&mut self, directory: &str, event: &SyncEvent) -> bool {
        self.handle_event_at(directory, event, now_ms())
    }

    /// [`handle_event`](Self::handle_event) with an explicit clock.
    pub fn handle_event_at(&mut self, directory: &str, event: &SyncEvent, now: i64) -> bool {
        match self.directories.get_mut(directory) {
            Some(state) => reducer::apply(state, event, now),
            None => false,
        }
    }

    /// Decode a wire event, make sure its directory exists, then apply it.
    ///
    /// Malformed events are dropped.
    pub fn handle_sse_event(&mut self, event: &GlobalEvent) -> bool {
        self.handle_sse_event_at(event, now_ms())
    }

    pub fn handle_sse_event_at(&mut self, event: &GlobalEvent, now: i64) -> bool {
        let decoded = match event.decode() {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(
                    "Dropping {} event for {}: {}",
                    event.payload.kind, event.directory, e
                );
                return false;
            }
        };
        self.apply_decoded_at(&event.directory, &decoded, now)
    }

    /// Apply an already decoded event, creating the directory if needed.
    pub fn apply_decoded(&mut self, directory: &str, event: &SyncEvent) -> bool {
        self.apply_decoded_at(directory, event, now_ms())
    }

    pub fn apply_decoded_at(&mut self, directory: &str, event: &SyncEvent, now: i64) -> bool {
        let created = self.init_directory(directory);
        self.handle_event_at(directory, event, now) || created
    }

    // ========================================================================
    // Hydration
    // ========================================================================

    /// Replace the session list from a full listing and mark the directory
    /// ready. Archived sessions are dropped.
    pub fn load_sessions(&mut self, directory: &str, sessions: Vec<Session>) {
        self.init_directory(directory);
        let sessions = sorted::sorted_unique(
            sessions
                .into_iter()
                .filter(|session| !session.is_archived())
                .collect(),
        );
        let Some(state) = self.directories.get_mut(directory) else {
            return;
        };
        if state.ready && *state.sessions == sessions {
            return;
        }
        let dir = Arc::make_mut(state);
        dir.sessions = Arc::new(sessions);
        dir.ready = true;
    }

    /// Replace one session's history (messages and their parts).
    ///
    /// Context usage is recomputed from the newest assistant message that
    /// reports tokens.
    pub fn load_messages(
        &mut self,
        directory: &str,
        session_id: &str,
        history: Vec<MessageWithParts>,
    ) {
        self.load_messages_at(directory, session_id, history, now_ms());
    }

    pub fn load_messages_at(
        &mut self,
        directory: &str,
        session_id: &str,
        history: Vec<MessageWithParts>,
        now: i64,
    ) {
        self.init_directory(directory);
        let Some(state) = self.directories.get_mut(directory) else {
            return;
        };

        let mut messages = Vec::with_capacity(history.len());
        let mut parts = Vec::with_capacity(history.len());
        for entry in history {
            if entry.info.session_id != session_id {
                continue;
            }
            parts.push((entry.info.id.clone(), sorted::sorted_unique(entry.parts)));
            messages.push(entry.info);
        }
        let messages = sorted::sorted_unique(messages);

        let dir = Arc::make_mut(state);
        let part_lists = Arc::make_mut(&mut dir.parts);
        if let Some(previous) = dir.messages.get(session_id) {
            for message in previous.iter() {
                part_lists.remove(&message.id);
            }
        }
        for (message_id, list) in parts {
            if !list.is_empty() && sorted::search(&messages, &message_id).found {
                part_lists.insert(message_id, Arc::new(list));
            }
        }

        let latest_tokens = messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(|m| {
                m.tokens
                    .filter(|t| !t.is_empty())
                    .map(|t| (t, m.model_id.clone()))
            });
        if let Some((tokens, model_id)) = latest_tokens {
            let limits = dir.model_limits_for(model_id.as_deref());
            let usage = derive::context_usage(&tokens, limits, now);
            Arc::make_mut(&mut dir.context_usage).insert(session_id.to_string(), usage);
        }

        let lists = Arc::make_mut(&mut dir.messages);
        if messages.is_empty() {
            lists.remove(session_id);
        } else {
            lists.insert(session_id.to_string(), Arc::new(messages));
        }
    }

    /// Apply a bulk load.
    pub fn hydrate(&mut self, hydration: Hydration) {
        match hydration {
            Hydration::Sessions {
                directory,
                sessions,
            } => self.load_sessions(&directory, sessions),
            Hydration::Messages {
                directory,
                session_id,
                history,
            } => self.load_messages(&directory, &session_id, history),
            Hydration::ModelLimits {
                directory,
                model_id,
                update,
            } => self.set_model_limits(&directory, &model_id, update),
        }
    }

    // ========================================================================
    // Model limits
    // ========================================================================

    /// Merge limits learned for a model into the directory's cache.
    pub fn set_model_limits(&mut self, directory: &str, model_id: &str, update: ModelLimitsUpdate) {
        self.init_directory(directory);
        let Some(state) = self.directories.get_mut(directory) else {
            return;
        };
        let merged = state.model_limits_for(Some(model_id)).merged(update);
        if state.model_limits.get(model_id) == Some(&merged) {
            return;
        }
        let dir = Arc::make_mut(state);
        Arc::make_mut(&mut dir.model_limits).insert(model_id.to_string(), merged);
    }

    /// Cached limits for a model, or [`DEFAULT_MODEL_LIMITS`].
    pub fn get_model_limits(&self, directory: &str, model_id: &str) -> ModelLimits {
        self.directories
            .get(directory)
            .map(|state| state.model_limits_for(Some(model_id)))
            .unwrap_or(DEFAULT_MODEL_LIMITS)
    }

    // ========================================================================
    // Read accessors
    // ========================================================================

    pub fn directory(&self, directory: &str) -> Option<&Arc<DirectoryState>> {
        self.directories.get(directory)
    }

    pub fn directories(&self) -> impl Iterator<Item = (&str, &Arc<DirectoryState>)> {
        self.directories
            .iter()
            .map(|(name, state)| (name.as_str(), state))
    }

    pub fn is_ready(&self, directory: &str) -> bool {
        self.directories
            .get(directory)
            .is_some_and(|state| state.ready)
    }

    pub fn get_sessions(&self, directory: &str) -> &[Session] {
        self.directories
            .get(directory)
            .map(|state| state.sessions.as_slice())
            .unwrap_or_default()
    }

    pub fn get_session(&self, directory: &str, session_id: &str) -> Option<&Session> {
        sorted::get(self.get_sessions(directory), session_id)
    }

    pub fn get_messages(&self, directory: &str, session_id: &str) -> &[Message] {
        self.directories
            .get(directory)
            .and_then(|state| state.messages.get(session_id))
            .map(|list| list.as_slice())
            .unwrap_or_default()
    }

    pub fn get_message(&self, directory: &str, session_id: &str, message_id: &str) -> Option<&Message> {
        sorted::get(self.get_messages(directory, session_id), message_id)
    }

    pub fn get_parts(&self, directory: &str, message_id: &str) -> &[Part] {
        self.directories
            .get(directory)
            .and_then(|state| state.parts.get(message_id))
            .map(|list| list.as_slice())
            .unwrap_or_default()
    }

    pub fn get_session_status(&self, directory: &str, session_id: &str) -> Option<RunState> {
        self.directories
            .get(directory)
            .and_then(|state| state.session_status.get(session_id))
            .copied()
    }

    pub fn get_last_activity(&self, directory: &str, session_id: &str) -> Option<i64> {
        self.directories
            .get(directory)
            .and_then(|state| state.session_last_activity.get(session_id))
            .copied()
    }

    pub fn get_context_usage(&self, directory: &str, session_id: &str) -> Option<&ContextUsage> {
        self.directories
            .get(directory)
            .and_then(|state| state.context_usage.get(session_id))
    }

    pub fn get_compaction(&self, directory: &str, session_id: &str) -> Option<&CompactionState> {
        self.directories
            .get(directory)
            .and_then(|state| state.compaction.get(session_id))
    }

    pub fn get_todos(&self, directory: &str, session_id: &str) -> &[Todo] {
        self.directories
            .get(directory)
            .and_then(|state| state.todos.get(session_id))
            .map(|list| list.as_slice())
            .unwrap_or_default()
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
