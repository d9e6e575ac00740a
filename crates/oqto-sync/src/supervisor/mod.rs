//! Connection supervision.
//!
//! [`ConnectionSupervisor`] keeps one [`connection`] task per discovered
//! server, reconciles that set against [`Discovery`] on an interval, and
//! fans every decoded event into a single channel tagged with its origin.
//! Ordering holds within one server's stream only.

mod backoff;
mod connection;
mod discovery;
mod status;
mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use oqto_sync_protocol::{GlobalEvent, SyncEvent};

use crate::batcher::Batchable;
use connection::{Command, Connection, ConnectionConfig};
use status::StatusBoard;

pub use backoff::{ReconnectPolicy, backoff_delay};
pub use discovery::{Discovery, ServerEndpoint, StaticDiscovery};
pub use status::{ConnectionStatus, ServerStatus, SyncStatus, Visibility};
pub use transport::{ByteStream, EVENT_PATH, EventTransport, HttpTransport, event_url};

/// An event as it left one server: the raw envelope plus its decoded form.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    /// Base URL of the server that sent it.
    pub server: String,
    pub raw: GlobalEvent,
    pub event: SyncEvent,
}

impl TaggedEvent {
    pub fn directory(&self) -> &str {
        &self.raw.directory
    }
}

impl Batchable for TaggedEvent {
    fn bypasses_batch(&self) -> bool {
        self.event.is_control()
    }
}

/// Tuning for the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub reconnect: ReconnectPolicy,
    /// Silence tolerated before a stream is considered dead.
    pub heartbeat_timeout: Duration,
    pub discovery_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            heartbeat_timeout: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
enum SupervisorCommand {
    SetVisibility(Visibility),
    Rediscover,
}

struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    fn send(&self, command: Command) {
        // A closed channel means the task already stopped.
        let _ = self.commands.send(command);
    }

    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Connection task ended abnormally: {}", e);
        }
    }
}

pub struct ConnectionSupervisor {
    config: SupervisorConfig,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn EventTransport>,
    events: mpsc::Sender<TaggedEvent>,
    board: StatusBoard,
    connections: HashMap<ServerEndpoint, ConnectionHandle>,
    visibility: Visibility,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        config: SupervisorConfig,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn EventTransport>,
        events: mpsc::Sender<TaggedEvent>,
    ) -> Self {
        Self {
            config,
            discovery,
            transport,
            events,
            board: StatusBoard::new(),
            connections: HashMap::new(),
            visibility: Visibility::Visible,
            cancel: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.board.subscribe()
    }

    /// Run discovery once and open or retire connections to match.
    ///
    /// A failed discovery leaves the current connections alone.
    pub async fn reconcile(&mut self) {
        self.board.set_discovering(true);
        let discovered = self.discovery.discover().await;
        self.board.set_discovering(false);

        let endpoints = match discovered {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("Server discovery failed: {}", e);
                return;
            }
        };
        let wanted: HashSet<ServerEndpoint> = endpoints.into_iter().collect();

        let retired: Vec<ServerEndpoint> = self
            .connections
            .keys()
            .filter(|endpoint| !wanted.contains(*endpoint))
            .cloned()
            .collect();
        for endpoint in retired {
            if let Some(handle) = self.connections.remove(&endpoint) {
                info!(
                    "Retiring connection to {} ({})",
                    endpoint.base_url, endpoint.directory
                );
                handle.stop().await;
            }
            self.board.remove(&endpoint);
        }

        let mut added: Vec<ServerEndpoint> = wanted
            .into_iter()
            .filter(|endpoint| !self.connections.contains_key(endpoint))
            .collect();
        added.sort();
        for endpoint in added {
            self.open(endpoint);
        }
    }

    fn open(&mut self, endpoint: ServerEndpoint) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.child_token();
        let connection = Connection::new(
            endpoint.clone(),
            Arc::clone(&self.transport),
            ConnectionConfig {
                policy: self.config.reconnect,
                heartbeat_timeout: self.config.heartbeat_timeout,
            },
            self.events.clone(),
            self.board.clone(),
            self.visibility == Visibility::Hidden,
        );
        let task = tokio::spawn(connection.run(commands_rx, cancel.clone()));
        self.connections.insert(
            endpoint,
            ConnectionHandle {
                commands: commands_tx,
                cancel,
                task,
            },
        );
    }

    /// Hidden aborts every stream; visible resets retry counts and
    /// reconnects immediately, re-arming failed connections.
    pub fn set_visibility(&mut self, visibility: Visibility) {
        if self.visibility == visibility {
            return;
        }
        info!("Host visibility changed to {:?}", visibility);
        self.visibility = visibility;
        let command = match visibility {
            Visibility::Hidden => Command::Pause,
            Visibility::Visible => Command::Resume,
        };
        for handle in self.connections.values() {
            handle.send(command);
        }
    }

    /// Stop every connection and wait for the tasks to finish.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        let endpoints: Vec<ServerEndpoint> = self.connections.keys().cloned().collect();
        for endpoint in endpoints {
            if let Some(handle) = self.connections.remove(&endpoint) {
                handle.stop().await;
            }
            self.board.remove(&endpoint);
        }
    }

    /// Move the supervisor onto its own task.
    pub fn spawn(self) -> SupervisorHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let status = self.board.subscribe();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run(commands_rx));
        SupervisorHandle {
            commands: commands_tx,
            status,
            cancel,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SupervisorCommand>) {
        let mut ticker = tokio::time::interval(self.config.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(SupervisorCommand::SetVisibility(visibility)) => {
                        self.set_visibility(visibility);
                    }
                    Some(SupervisorCommand::Rediscover) => {
                        self.reconcile().await;
                        ticker.reset();
                    }
                    None => break,
                },
                _ = ticker.tick() => self.reconcile().await,
            }
        }

        debug!("Supervisor stopping {} connections", self.connections.len());
        self.shutdown().await;
    }
}

/// Control surface of a spawned [`ConnectionSupervisor`].
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    status: watch::Receiver<SyncStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn set_visibility(&self, visibility: Visibility) {
        let _ = self
            .commands
            .send(SupervisorCommand::SetVisibility(visibility));
    }

    /// Run discovery now instead of waiting for the next interval.
    pub fn rediscover(&self) {
        let _ = self.commands.send(SupervisorCommand::Rediscover);
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop all connections and wait for them to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Supervisor task ended abnormally: {}", e);
        }
    }
}
