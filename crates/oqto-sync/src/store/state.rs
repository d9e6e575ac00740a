//! Per-directory state and the values derived from it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use oqto_sync_protocol::{Message, Part, RunState, Session, Todo};

/// Limits assumed for a model we have not learned anything about.
pub const DEFAULT_MODEL_LIMITS: ModelLimits = ModelLimits {
    context: 128_000,
    output: 4_096,
};

/// Everything the client knows about one project directory.
///
/// Every branch sits behind an `Arc`. Writers go through `Arc::make_mut`, so
/// a snapshot taken before an event keeps pointing at the old branches and
/// branches an event did not touch stay pointer-identical across snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryState {
    pub ready: bool,
    /// Sorted by id.
    pub sessions: Arc<Vec<Session>>,
    pub session_status: Arc<HashMap<String, RunState>>,
    /// Unix ms of the last status change per session.
    pub session_last_activity: Arc<HashMap<String, i64>>,
    /// Session id -> messages sorted by id.
    pub messages: Arc<HashMap<String, Arc<Vec<Message>>>>,
    /// Message id -> parts sorted by id.
    pub parts: Arc<HashMap<String, Arc<Vec<Part>>>>,
    pub context_usage: Arc<HashMap<String, ContextUsage>>,
    pub compaction: Arc<HashMap<String, CompactionState>>,
    /// Session id -> todo list, replaced wholesale.
    pub todos: Arc<HashMap<String, Arc<Vec<Todo>>>>,
    /// Model id -> limits. Entries are merged, never replaced.
    pub model_limits: Arc<HashMap<String, ModelLimits>>,
}

impl DirectoryState {
    pub fn model_limits_for(&self, model_id: Option<&str>) -> ModelLimits {
        model_id
            .and_then(|id| self.model_limits.get(id))
            .copied()
            .unwrap_or(DEFAULT_MODEL_LIMITS)
    }

    /// Find the session a message belongs to by scanning the message lists.
    pub fn owning_session(&self, message_id: &str) -> Option<&str> {
        self.messages
            .iter()
            .find(|(_, list)| crate::sorted::search(list, message_id).found)
            .map(|(session_id, _)| session_id.as_str())
    }

    pub fn message_count(&self) -> usize {
        self.messages.values().map(|list| list.len()).sum()
    }
}

/// Token budget of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub context: u64,
    pub output: u64,
}

/// A partial limits update. Absent fields keep what was learned before.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimitsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
}

impl ModelLimits {
    pub fn merged(self, update: ModelLimitsUpdate) -> Self {
        Self {
            context: update.context.unwrap_or(self.context),
            output: update.output.unwrap_or(self.output),
        }
    }
}

/// How full a session's context window is. Derived from message tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub used: u64,
    /// Usable context: the model window minus the reserved output budget.
    pub limit: u64,
    pub percentage: u32,
    pub is_near_limit: bool,
    pub tokens: ContextTokens,
    pub last_updated: i64,
}

impl ContextUsage {
    /// Equal apart from the timestamp.
    pub fn same_reading(&self, other: &Self) -> bool {
        self.used == other.used
            && self.limit == other.limit
            && self.percentage == other.percentage
            && self.is_near_limit == other.is_near_limit
            && self.tokens == other.tokens
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTokens {
    pub input: u64,
    pub output: u64,
    pub cached: u64,
}

/// Progress of a history compaction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionProgress {
    Pending,
    Generating,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionState {
    pub is_compacting: bool,
    pub is_automatic: bool,
    pub started_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub progress: CompactionProgress,
}
