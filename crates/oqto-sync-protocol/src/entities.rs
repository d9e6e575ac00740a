//! Entities carried by opencode events.
//!
//! Field names follow the opencode wire format (`sessionID`, `modelID`, ...).
//! Fields this client does not interpret are kept in `extra` so a snapshot
//! re-serializes without loss.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Sessions
// ============================================================================

/// A chat session. Ids are ULID-like and sort lexicographically by creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub directory: String,

    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(default)]
    pub time: SessionTime,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Session {
    /// Archived sessions are dropped from the store, never kept with a flag.
    pub fn is_archived(&self) -> bool {
        self.time.archived.is_some()
    }
}

/// Session timestamps (Unix ms).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<i64>,
}

// ============================================================================
// Messages
// ============================================================================

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Unknown,
}

/// A message header. Content lives in its parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,

    #[serde(rename = "sessionID")]
    pub session_id: String,

    pub role: Role,

    #[serde(default)]
    pub time: MessageTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,

    /// Agent that produced the message; `"compaction"` marks a summary run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// `true` on assistant summary messages. User messages carry an object here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,

    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Whether this message is the output of a compaction run.
    pub fn is_compaction_summary(&self) -> bool {
        self.role == Role::Assistant
            && (self.agent.as_deref() == Some("compaction")
                || matches!(self.summary, Some(Value::Bool(true))))
    }

    /// Whether the message has finished generating.
    pub fn is_completed(&self) -> bool {
        self.time.completed.is_some()
    }
}

/// Message timestamps (Unix ms).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// Token counts reported on assistant messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub reasoning: u64,
    #[serde(default)]
    pub cache: CacheTokens,
}

impl TokenUsage {
    /// All-zero counts are reported while a message is still streaming.
    pub fn is_empty(&self) -> bool {
        self.input == 0 && self.output == 0 && self.cache.read == 0 && self.cache.write == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    #[serde(default)]
    pub read: u64,
    #[serde(default)]
    pub write: u64,
}

// ============================================================================
// Parts
// ============================================================================

/// One content block of a message (text, tool call, compaction marker, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,

    #[serde(rename = "messageID")]
    pub message_id: String,

    #[serde(rename = "sessionID", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PartState>,

    /// Set on `compaction` parts: `true` when the backend triggered it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    pub fn is_compaction(&self) -> bool {
        self.kind == "compaction"
    }
}

/// Nested tool state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartState {
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A message together with its parts, as returned by history loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: Message,
    #[serde(default)]
    pub parts: Vec<Part>,
}

// ============================================================================
// Todos
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub status: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
