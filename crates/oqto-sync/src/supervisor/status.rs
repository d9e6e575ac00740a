//! Observable connection state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::discovery::ServerEndpoint;

/// Lifecycle of one server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    /// Suspended while the host is hidden.
    Paused,
    /// Waiting out a backoff delay.
    Error,
    /// Retry budget exhausted. Only a visibility change re-arms it.
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Whether the host is in the foreground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub url: String,
    pub directory: String,
    pub status: ConnectionStatus,
    pub retry_count: u32,
}

/// What consumers see of the connection layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// At least one server is streaming.
    pub connected: bool,
    pub server_count: usize,
    /// A discovery pass is in flight.
    pub discovering: bool,
    /// Sorted by url, then directory.
    pub servers: Vec<ServerStatus>,
}

impl SyncStatus {
    fn refresh(&mut self) {
        self.connected = self
            .servers
            .iter()
            .any(|s| s.status == ConnectionStatus::Connected);
        self.server_count = self.servers.len();
    }

    pub fn server(&self, endpoint: &ServerEndpoint) -> Option<&ServerStatus> {
        self.servers
            .iter()
            .find(|s| s.url == endpoint.base_url && s.directory == endpoint.directory)
    }

    /// Servers that gave up reconnecting.
    pub fn failed(&self) -> impl Iterator<Item = &ServerStatus> {
        self.servers
            .iter()
            .filter(|s| s.status == ConnectionStatus::Failed)
    }
}

/// Shared writer for [`SyncStatus`]. Receivers are only woken on real changes.
#[derive(Debug, Clone)]
pub(crate) struct StatusBoard {
    tx: Arc<watch::Sender<SyncStatus>>,
}

impl StatusBoard {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn update(&self, endpoint: &ServerEndpoint, status: ConnectionStatus, retry_count: u32) {
        let entry = ServerStatus {
            url: endpoint.base_url.clone(),
            directory: endpoint.directory.clone(),
            status,
            retry_count,
        };
        self.tx.send_if_modified(|state| {
            let position = state
                .servers
                .binary_search_by(|s| (&s.url, &s.directory).cmp(&(&entry.url, &entry.directory)));
            match position {
                Ok(i) if state.servers[i] == entry => return false,
                Ok(i) => state.servers[i] = entry,
                Err(i) => state.servers.insert(i, entry),
            }
            state.refresh();
            true
        });
    }

    pub(crate) fn remove(&self, endpoint: &ServerEndpoint) {
        self.tx.send_if_modified(|state| {
            let before = state.servers.len();
            state
                .servers
                .retain(|s| !(s.url == endpoint.base_url && s.directory == endpoint.directory));
            if state.servers.len() == before {
                return false;
            }
            state.refresh();
            true
        });
    }

    pub(crate) fn set_discovering(&self, discovering: bool) {
        self.tx.send_if_modified(|state| {
            if state.discovering == discovering {
                return false;
            }
            state.discovering = discovering;
            true
        });
    }
}
