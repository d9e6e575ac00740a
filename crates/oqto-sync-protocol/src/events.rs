//! Event envelope and typed events.
//!
//! The wire envelope is `{directory, payload: {type, properties}}` and is kept
//! verbatim in [`GlobalEvent`]. [`SyncEvent::decode`] turns a payload into a
//! typed event once, at ingress, using [`DECODE_TABLE`] to know which
//! property carries the entity for each event type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::{Message, Part, Session, Todo};
use crate::error::DecodeError;

// ============================================================================
// Envelope
// ============================================================================

/// One event from the global stream, tagged with the directory it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalEvent {
    pub directory: String,
    pub payload: EventPayload,
}

/// The untyped event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub properties: Value,
}

impl GlobalEvent {
    /// Parse the `data` of one stream frame.
    ///
    /// Per-directory servers emit bare `{type, properties}` payloads with no
    /// envelope; those are attributed to `default_directory`. An envelope
    /// with an empty directory gets the same treatment.
    pub fn from_frame(data: &str, default_directory: &str) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_str(data)?;
        let Value::Object(mut map) = value else {
            return Err(DecodeError::MissingType);
        };

        if let Some(payload) = map.remove("payload") {
            let directory = map
                .get("directory")
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
                .unwrap_or(default_directory)
                .to_string();
            let payload: EventPayload = serde_json::from_value(payload)?;
            return Ok(Self { directory, payload });
        }

        if !map.contains_key("type") {
            return Err(DecodeError::MissingType);
        }
        let payload: EventPayload = serde_json::from_value(Value::Object(map))?;
        Ok(Self {
            directory: default_directory.to_string(),
            payload,
        })
    }

    /// Decode the payload into a typed event.
    pub fn decode(&self) -> Result<SyncEvent, DecodeError> {
        SyncEvent::decode(&self.payload)
    }
}

// ============================================================================
// Typed events
// ============================================================================

/// Coarse run state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
}

impl RunState {
    /// Map an opencode status name onto the two states the store tracks.
    pub fn from_status_name(name: &str) -> Option<Self> {
        match name {
            "busy" | "running" | "retry" | "working" => Some(Self::Running),
            "idle" | "completed" | "done" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// A decoded event. The set is closed; anything else becomes `Unknown`.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ServerConnected,
    ServerHeartbeat,
    SessionCreated(Session),
    SessionUpdated(Session),
    SessionStatus {
        session_id: String,
        status: RunState,
    },
    SessionDeleted {
        session_id: String,
    },
    SessionCompacted {
        session_id: String,
    },
    MessageUpdated(Message),
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    PartUpdated(Part),
    PartRemoved {
        message_id: String,
        part_id: String,
    },
    TodoUpdated {
        session_id: String,
        todos: Vec<Todo>,
    },
    Unknown {
        kind: String,
    },
}

/// How the properties of a given event type are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Connection-level signal with no meaningful properties.
    Control,
    /// An entity under the first present key, checked in the listed order.
    Entity(&'static [&'static str]),
    /// Explicit id fields only.
    Ids,
}

/// Per-type decode table. Upsert events list the properties that may carry
/// their entity; removal events carry id fields.
pub const DECODE_TABLE: &[(&str, Shape)] = &[
    ("server.connected", Shape::Control),
    ("server.heartbeat", Shape::Control),
    ("session.created", Shape::Entity(&["info", "item"])),
    ("session.updated", Shape::Entity(&["info", "item"])),
    ("session.status", Shape::Ids),
    ("session.deleted", Shape::Ids),
    ("session.compacted", Shape::Ids),
    ("message.updated", Shape::Entity(&["info", "item", "message"])),
    ("message.removed", Shape::Ids),
    ("message.part.updated", Shape::Entity(&["part", "item"])),
    ("message.part.removed", Shape::Ids),
    ("todo.updated", Shape::Ids),
];

/// Look up the layout of an event type.
pub fn shape_of(kind: &str) -> Option<Shape> {
    DECODE_TABLE
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, shape)| *shape)
}

impl SyncEvent {
    /// Decode a payload. Unknown types are not an error.
    pub fn decode(payload: &EventPayload) -> Result<Self, DecodeError> {
        let kind = payload.kind.as_str();
        if kind.is_empty() {
            return Err(DecodeError::MissingType);
        }
        let Some(shape) = shape_of(kind) else {
            return Ok(Self::Unknown {
                kind: kind.to_string(),
            });
        };

        let empty = Map::new();
        let props = payload.properties.as_object().unwrap_or(&empty);

        let event = match (kind, shape) {
            ("server.connected", _) => Self::ServerConnected,
            ("server.heartbeat", _) => Self::ServerHeartbeat,
            ("session.created", Shape::Entity(keys)) => {
                Self::SessionCreated(entity(kind, props, keys)?)
            }
            ("session.updated", Shape::Entity(keys)) => {
                Self::SessionUpdated(entity(kind, props, keys)?)
            }
            ("session.status", _) => Self::SessionStatus {
                session_id: id_field(kind, props, "sessionID")?,
                status: run_state(kind, props)?,
            },
            ("session.deleted", _) => {
                // Newer servers send the whole session under `info`.
                let session_id = props
                    .get("info")
                    .and_then(|info| info.get("id"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Self::SessionDeleted {
                    session_id: match session_id {
                        Some(id) => id,
                        None => id_field(kind, props, "sessionID")?,
                    },
                }
            }
            ("session.compacted", _) => Self::SessionCompacted {
                session_id: id_field(kind, props, "sessionID")?,
            },
            ("message.updated", Shape::Entity(keys)) => {
                Self::MessageUpdated(entity(kind, props, keys)?)
            }
            ("message.removed", _) => Self::MessageRemoved {
                session_id: id_field(kind, props, "sessionID")?,
                message_id: id_field(kind, props, "messageID")?,
            },
            ("message.part.updated", Shape::Entity(keys)) => {
                Self::PartUpdated(entity(kind, props, keys)?)
            }
            ("message.part.removed", _) => Self::PartRemoved {
                message_id: id_field(kind, props, "messageID")?,
                part_id: id_field(kind, props, "partID")?,
            },
            ("todo.updated", _) => {
                let session_id = id_field(kind, props, "sessionID")?;
                let todos = match props.get("todos") {
                    Some(raw) => serde_json::from_value(raw.clone()).map_err(|source| {
                        DecodeError::InvalidEntity {
                            kind: kind.to_string(),
                            source,
                        }
                    })?,
                    None => Vec::new(),
                };
                Self::TodoUpdated { session_id, todos }
            }
            _ => Self::Unknown {
                kind: kind.to_string(),
            },
        };
        Ok(event)
    }

    /// Control events drive liveness and are never delayed by batching.
    pub fn is_control(&self) -> bool {
        matches!(self, Self::ServerConnected | Self::ServerHeartbeat)
    }
}

fn entity<T: serde::de::DeserializeOwned>(
    kind: &str,
    props: &Map<String, Value>,
    keys: &'static [&'static str],
) -> Result<T, DecodeError> {
    let raw = keys
        .iter()
        .find_map(|key| props.get(*key).filter(|v| v.is_object()))
        .ok_or_else(|| DecodeError::MissingEntity {
            kind: kind.to_string(),
            keys,
        })?;
    serde_json::from_value(raw.clone()).map_err(|source| DecodeError::InvalidEntity {
        kind: kind.to_string(),
        source,
    })
}

fn id_field(
    kind: &str,
    props: &Map<String, Value>,
    field: &'static str,
) -> Result<String, DecodeError> {
    props
        .get(field)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| DecodeError::MissingField {
            kind: kind.to_string(),
            field,
        })
}

/// `status` is either a plain name or an object with a `type` field.
fn run_state(kind: &str, props: &Map<String, Value>) -> Result<RunState, DecodeError> {
    let name = match props.get("status") {
        Some(Value::String(name)) => name.as_str(),
        Some(Value::Object(obj)) => obj.get("type").and_then(Value::as_str).unwrap_or(""),
        _ => {
            return Err(DecodeError::MissingField {
                kind: kind.to_string(),
                field: "status",
            });
        }
    };
    RunState::from_status_name(name).ok_or_else(|| DecodeError::UnknownStatus(name.to_string()))
}
