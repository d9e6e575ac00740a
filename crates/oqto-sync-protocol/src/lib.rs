//! Wire types for the opencode global event stream.
//!
//! This crate has no I/O. It defines:
//! - the `{directory, payload: {type, properties}}` envelope ([`GlobalEvent`])
//! - the typed event sum ([`SyncEvent`]) decoded once at ingress
//! - the entities carried by events ([`Session`], [`Message`], [`Part`], [`Todo`])
//! - the text-event-stream framing decoder ([`SseDecoder`])

pub mod entities;
pub mod error;
pub mod events;
pub mod sse;

pub use entities::{
    CacheTokens, Message, MessageTime, MessageWithParts, Part, PartState, Role, Session,
    SessionTime, Todo, TokenUsage,
};
pub use error::DecodeError;
pub use events::{EventPayload, GlobalEvent, RunState, SyncEvent};
pub use sse::{SseDecoder, SseFrame};
