//! Event application.
//!
//! Every function here is synchronous and total. Each one checks whether the
//! event changes anything before calling `Arc::make_mut`, so duplicate
//! deliveries leave the state pointer-identical and report `false`.

use std::sync::Arc;

use oqto_sync_protocol::{Message, Part, RunState, Session, SyncEvent, Todo};

use super::derive;
use super::state::{CompactionProgress, CompactionState, ContextUsage, DirectoryState};
use crate::sorted;

// ============================================================================
// Helpers
// ============================================================================

/// Remove `key` from one keyed branch, cloning only when it is present.
macro_rules! remove_entry {
    ($state:expr, $field:ident, $key:expr) => {{
        if $state.$field.contains_key($key) {
            Arc::make_mut(&mut Arc::make_mut($state).$field).remove($key);
            true
        } else {
            false
        }
    }};
}

/// Apply one event. Returns whether the state changed.
pub(crate) fn apply(state: &mut Arc<DirectoryState>, event: &SyncEvent, now: i64) -> bool {
    match event {
        SyncEvent::ServerConnected | SyncEvent::ServerHeartbeat | SyncEvent::Unknown { .. } => {
            false
        }
        SyncEvent::SessionCreated(session) | SyncEvent::SessionUpdated(session) => {
            upsert_session(state, session)
        }
        SyncEvent::SessionStatus { session_id, status } => {
            set_status(state, session_id, *status, now)
        }
        SyncEvent::SessionDeleted { session_id } => delete_session(state, session_id),
        SyncEvent::SessionCompacted { session_id } => {
            remove_entry!(state, compaction, session_id)
        }
        SyncEvent::MessageUpdated(message) => update_message(state, message, now),
        SyncEvent::MessageRemoved {
            session_id,
            message_id,
        } => remove_message(state, session_id, message_id),
        SyncEvent::PartUpdated(part) => update_part(state, part, now),
        SyncEvent::PartRemoved {
            message_id,
            part_id,
        } => remove_part(state, message_id, part_id),
        SyncEvent::TodoUpdated { session_id, todos } => set_todos(state, session_id, todos),
    }
}

// ============================================================================
// Sessions
// ============================================================================

fn upsert_session(state: &mut Arc<DirectoryState>, session: &Session) -> bool {
    if session.is_archived() {
        if !sorted::search(&state.sessions, &session.id).found {
            return false;
        }
        let dir = Arc::make_mut(state);
        sorted::remove(Arc::make_mut(&mut dir.sessions), &session.id);
        return true;
    }

    if !sorted::would_change(&state.sessions, session) {
        return false;
    }
    let dir = Arc::make_mut(state);
    sorted::upsert(Arc::make_mut(&mut dir.sessions), session.clone());
    true
}

fn set_status(
    state: &mut Arc<DirectoryState>,
    session_id: &str,
    status: RunState,
    now: i64,
) -> bool {
    let same_status = state.session_status.get(session_id) == Some(&status);
    let same_stamp = state.session_last_activity.get(session_id) == Some(&now);
    if same_status && same_stamp {
        return false;
    }

    let dir = Arc::make_mut(state);
    if !same_status {
        Arc::make_mut(&mut dir.session_status).insert(session_id.to_string(), status);
    }
    if !same_stamp {
        Arc::make_mut(&mut dir.session_last_activity).insert(session_id.to_string(), now);
    }
    true
}

/// Remove the session and everything hanging off it.
fn delete_session(state: &mut Arc<DirectoryState>, session_id: &str) -> bool {
    let mut changed = false;

    if sorted::search(&state.sessions, session_id).found {
        let dir = Arc::make_mut(state);
        sorted::remove(Arc::make_mut(&mut dir.sessions), session_id);
        changed = true;
    }

    if let Some(messages) = state.messages.get(session_id).cloned() {
        let dir = Arc::make_mut(state);
        Arc::make_mut(&mut dir.messages).remove(session_id);
        if messages.iter().any(|m| dir.parts.contains_key(&m.id)) {
            let parts = Arc::make_mut(&mut dir.parts);
            for message in messages.iter() {
                parts.remove(&message.id);
            }
        }
        changed = true;
    }

    changed |= remove_entry!(state, session_status, session_id);
    changed |= remove_entry!(state, session_last_activity, session_id);
    changed |= remove_entry!(state, context_usage, session_id);
    changed |= remove_entry!(state, compaction, session_id);
    changed |= remove_entry!(state, todos, session_id);
    changed
}

fn set_todos(state: &mut Arc<DirectoryState>, session_id: &str, todos: &[Todo]) -> bool {
    if state
        .todos
        .get(session_id)
        .is_some_and(|current| current.as_slice() == todos)
    {
        return false;
    }
    let dir = Arc::make_mut(state);
    Arc::make_mut(&mut dir.todos).insert(session_id.to_string(), Arc::new(todos.to_vec()));
    true
}

// ============================================================================
// Messages
// ============================================================================

fn update_message(state: &mut Arc<DirectoryState>, message: &Message, now: i64) -> bool {
    let mut changed = false;

    let needs_write = state
        .messages
        .get(&message.session_id)
        .is_none_or(|list| sorted::would_change(list, message));
    if needs_write {
        let dir = Arc::make_mut(state);
        let lists = Arc::make_mut(&mut dir.messages);
        let list = lists.entry(message.session_id.clone()).or_default();
        sorted::upsert(Arc::make_mut(list), message.clone());
        changed = true;
    }

    if let Some(tokens) = message.tokens.filter(|t| !t.is_empty()) {
        let limits = state.model_limits_for(message.model_id.as_deref());
        let usage = derive::context_usage(&tokens, limits, now);
        changed |= set_context_usage(state, &message.session_id, usage);
    }

    if message.is_compaction_summary() {
        changed |= track_summary(state, message, now);
    }

    changed
}

fn remove_message(state: &mut Arc<DirectoryState>, session_id: &str, message_id: &str) -> bool {
    let mut changed = false;

    let present = state
        .messages
        .get(session_id)
        .is_some_and(|list| sorted::search(list, message_id).found);
    if present {
        let dir = Arc::make_mut(state);
        let lists = Arc::make_mut(&mut dir.messages);
        if let Some(list) = lists.get_mut(session_id) {
            let list = Arc::make_mut(list);
            sorted::remove(list, message_id);
            if list.is_empty() {
                lists.remove(session_id);
            }
        }
        changed = true;
    }

    changed | remove_entry!(state, parts, message_id)
}

/// Keep the previous reading when only the timestamp would move.
fn set_context_usage(
    state: &mut Arc<DirectoryState>,
    session_id: &str,
    usage: ContextUsage,
) -> bool {
    if state
        .context_usage
        .get(session_id)
        .is_some_and(|current| current.same_reading(&usage))
    {
        return false;
    }
    let dir = Arc::make_mut(state);
    Arc::make_mut(&mut dir.context_usage).insert(session_id.to_string(), usage);
    true
}

/// A summary message means compaction is generating, or done once completed.
fn track_summary(state: &mut Arc<DirectoryState>, message: &Message, now: i64) -> bool {
    let existing = state.compaction.get(&message.session_id);

    // A leftover entry from an earlier summary does not carry over.
    let carried = existing.filter(|c| {
        c.message_id.is_none() || c.message_id.as_deref() == Some(message.id.as_str())
    });

    let progress = if message.is_completed() {
        CompactionProgress::Complete
    } else {
        CompactionProgress::Generating
    };
    let next = CompactionState {
        is_compacting: progress != CompactionProgress::Complete,
        is_automatic: carried.is_some_and(|c| c.is_automatic),
        started_at: carried.map_or(now, |c| c.started_at),
        message_id: Some(message.id.clone()),
        progress,
    };

    if existing == Some(&next) {
        return false;
    }
    let dir = Arc::make_mut(state);
    Arc::make_mut(&mut dir.compaction).insert(message.session_id.clone(), next);
    true
}

// ============================================================================
// Parts
// ============================================================================

fn update_part(state: &mut Arc<DirectoryState>, part: &Part, now: i64) -> bool {
    let needs_write = state
        .parts
        .get(&part.message_id)
        .is_none_or(|list| sorted::would_change(list, part));
    if !needs_write {
        return false;
    }

    let dir = Arc::make_mut(state);
    let lists = Arc::make_mut(&mut dir.parts);
    let list = lists.entry(part.message_id.clone()).or_default();
    sorted::upsert(Arc::make_mut(list), part.clone());

    if part.is_compaction() {
        let session_id = state
            .owning_session(&part.message_id)
            .map(str::to_string)
            .or_else(|| part.session_id.clone().filter(|id| !id.is_empty()));
        if let Some(session_id) = session_id {
            mark_compaction(state, &session_id, part.auto.unwrap_or(false), now);
        }
    }
    true
}

/// A compaction part says who asked for the run. It may arrive before the
/// summary message, in which case the run is opened as pending.
fn mark_compaction(state: &mut Arc<DirectoryState>, session_id: &str, auto: bool, now: i64) {
    let open = state
        .compaction
        .get(session_id)
        .filter(|c| c.progress != CompactionProgress::Complete);
    let next = match open {
        Some(current) if current.is_automatic == auto => return,
        Some(current) => CompactionState {
            is_automatic: auto,
            ..current.clone()
        },
        // Nothing running, or only a finished run awaiting `session.compacted`.
        None => CompactionState {
            is_compacting: true,
            is_automatic: auto,
            started_at: now,
            message_id: None,
            progress: CompactionProgress::Pending,
        },
    };
    let dir = Arc::make_mut(state);
    Arc::make_mut(&mut dir.compaction).insert(session_id.to_string(), next);
}

fn remove_part(state: &mut Arc<DirectoryState>, message_id: &str, part_id: &str) -> bool {
    let present = state
        .parts
        .get(message_id)
        .is_some_and(|list| sorted::search(list, part_id).found);
    if !present {
        return false;
    }

    let dir = Arc::make_mut(state);
    let lists = Arc::make_mut(&mut dir.parts);
    if let Some(list) = lists.get_mut(message_id) {
        let list = Arc::make_mut(list);
        sorted::remove(list, part_id);
        if list.is_empty() {
            lists.remove(message_id);
        }
    }
    true
}

