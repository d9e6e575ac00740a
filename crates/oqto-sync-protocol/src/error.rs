//! Decode error types.

use thiserror::Error;

/// Why an incoming frame could not be turned into a typed event.
///
/// These never propagate past the ingress boundary: callers log and drop.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame body is not valid JSON or not an event envelope.
    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope carries no event type.
    #[error("event has no type")]
    MissingType,

    /// A known upsert event without its entity.
    #[error("{kind}: no entity under any of {keys:?}")]
    MissingEntity {
        kind: String,
        keys: &'static [&'static str],
    },

    /// A known event without one of its id fields.
    #[error("{kind}: missing field `{field}`")]
    MissingField { kind: String, field: &'static str },

    /// The entity is present but has the wrong shape.
    #[error("{kind}: malformed entity: {source}")]
    InvalidEntity {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// A session status value we do not recognise.
    #[error("unknown session status: {0}")]
    UnknownStatus(String),
}
