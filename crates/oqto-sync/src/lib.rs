//! Real-time state sync for opencode servers.
//!
//! Connections to every discovered server feed one event stream. Events are
//! batched per subscriber and applied to an event-sourced, per-directory
//! store that publishes copy-on-write snapshots.

pub mod batcher;
pub mod config;
pub mod engine;
pub mod error;
pub mod sorted;
pub mod store;
pub mod supervisor;

pub use batcher::{BatchSender, Batchable, Dispatch, EventBatcher};
pub use crate::config::{EngineConfig, Settings};
pub use engine::{Subscription, SyncEngine};
pub use error::{ConnectionOutcome, DiscoveryError, SyncError, TransportError};
pub use store::{DirectoryState, DirectoryStore, Hydration};
pub use supervisor::{
    ConnectionStatus, ConnectionSupervisor, Discovery, EventTransport, HttpTransport,
    ServerEndpoint, StaticDiscovery, SupervisorConfig, SyncStatus, TaggedEvent, Visibility,
};

pub use oqto_sync_protocol as protocol;
