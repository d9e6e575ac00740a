//! Error types for the sync engine.

use thiserror::Error;

/// Failure to open or read an event stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("event stream read failed: {0}")]
    Body(#[source] reqwest::Error),

    #[error("event stream failed: {0}")]
    Stream(String),
}

/// Failure to enumerate servers.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid server endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },
}

/// Engine-level failures surfaced to the embedding application.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("engine has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// How one streaming attempt ended.
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// Intentional teardown: pause, stop, or retirement. Never counts
    /// against the retry budget.
    Aborted,
    /// No event arrived before the heartbeat deadline.
    HeartbeatTimeout,
    Transport(TransportError),
    /// The server closed the stream.
    Ended,
}

impl ConnectionOutcome {
    /// Whether this outcome consumes a retry.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Aborted)
    }
}

impl std::fmt::Display for ConnectionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aborted => write!(f, "aborted"),
            Self::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Ended => write!(f, "stream ended"),
        }
    }
}
