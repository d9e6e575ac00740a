//! One server's event stream with automatic reconnection.
//!
//! The task cycles `idle -> connecting -> connected -> {error | paused} ->
//! connecting ...`. A run of failures longer than the retry budget parks it
//! in `failed` until a resume command re-arms it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use oqto_sync_protocol::{GlobalEvent, SseDecoder, SseFrame};

use super::TaggedEvent;
use super::backoff::ReconnectPolicy;
use super::discovery::ServerEndpoint;
use super::status::{ConnectionStatus, StatusBoard};
use super::transport::EventTransport;
use crate::error::ConnectionOutcome;

/// Control messages from the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    /// Abort the stream and stay down.
    Pause,
    /// Clear the retry count and reconnect now.
    Resume,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionConfig {
    pub policy: ReconnectPolicy,
    pub heartbeat_timeout: Duration,
}

pub(crate) struct Connection {
    endpoint: ServerEndpoint,
    transport: Arc<dyn EventTransport>,
    config: ConnectionConfig,
    events: mpsc::Sender<TaggedEvent>,
    board: StatusBoard,
    /// Consecutive failed attempts.
    failures: u32,
    paused: bool,
}

impl Connection {
    pub(crate) fn new(
        endpoint: ServerEndpoint,
        transport: Arc<dyn EventTransport>,
        config: ConnectionConfig,
        events: mpsc::Sender<TaggedEvent>,
        board: StatusBoard,
        paused: bool,
    ) -> Self {
        Self {
            endpoint,
            transport,
            config,
            events,
            board,
            failures: 0,
            paused,
        }
    }

    fn report(&self, status: ConnectionStatus) {
        self.board.update(&self.endpoint, status, self.failures);
    }

    /// Drive the connection until `cancel` fires or the command channel closes.
    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        info!(
            "Starting event stream for {} ({})",
            self.endpoint.base_url, self.endpoint.directory
        );
        self.report(ConnectionStatus::Idle);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.paused {
                self.report(ConnectionStatus::Paused);
                if !self.wait_for_command(&mut commands, &cancel).await {
                    break;
                }
                continue;
            }

            if self.config.policy.exhausted(self.failures) {
                error!(
                    "Giving up on {} after {} failed attempts",
                    self.endpoint.base_url, self.failures
                );
                self.report(ConnectionStatus::Failed);
                if !self.wait_for_command(&mut commands, &cancel).await {
                    break;
                }
                continue;
            }

            if self.failures > 0 {
                let delay = self.config.policy.delay_for(self.failures - 1);
                self.report(ConnectionStatus::Error);
                warn!(
                    "Reconnecting to {} in {}ms (attempt {}/{})",
                    self.endpoint.base_url,
                    delay.as_millis(),
                    self.failures,
                    self.config.policy.max_attempts
                );
                if !self.backoff(delay, &mut commands, &cancel).await {
                    break;
                }
                if self.paused {
                    continue;
                }
            }

            self.report(ConnectionStatus::Connecting);
            match self.stream_once(&mut commands, &cancel).await {
                ConnectionOutcome::Aborted => {
                    debug!("Event stream for {} aborted", self.endpoint.base_url);
                }
                ConnectionOutcome::HeartbeatTimeout => {
                    warn!(
                        "No events from {} for {}s, reconnecting",
                        self.endpoint.base_url,
                        self.config.heartbeat_timeout.as_secs()
                    );
                    self.failures += 1;
                }
                ConnectionOutcome::Transport(e) => {
                    warn!(
                        "Event stream for {} failed (attempt {}): {}",
                        self.endpoint.base_url,
                        self.failures + 1,
                        e
                    );
                    self.failures += 1;
                }
                ConnectionOutcome::Ended => {
                    info!("Event stream for {} ended", self.endpoint.base_url);
                    self.failures += 1;
                }
            }
        }

        debug!("Connection task for {} stopped", self.endpoint.base_url);
    }

    /// Apply a command. Returns `true` if the current stream must be torn down.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Pause => {
                let was_paused = self.paused;
                self.paused = true;
                !was_paused
            }
            Command::Resume => {
                self.paused = false;
                self.failures = 0;
                false
            }
        }
    }

    /// Park until a command arrives. Returns `false` on stop.
    async fn wait_for_command(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            command = commands.recv() => match command {
                Some(command) => {
                    self.apply(command);
                    true
                }
                None => false,
            },
        }
    }

    /// Sleep before a retry. A command cuts the wait short. Returns `false`
    /// on stop.
    async fn backoff(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            command = commands.recv() => match command {
                Some(command) => {
                    self.apply(command);
                    true
                }
                None => false,
            },
            _ = sleep(delay) => true,
        }
    }

    /// One connect-and-read attempt.
    async fn stream_once(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        cancel: &CancellationToken,
    ) -> ConnectionOutcome {
        let transport = Arc::clone(&self.transport);
        let endpoint = self.endpoint.clone();
        let open = async move { transport.open(&endpoint).await };
        tokio::pin!(open);

        let mut stream = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ConnectionOutcome::Aborted,
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.apply(command) {
                            return ConnectionOutcome::Aborted;
                        }
                    }
                    None => return ConnectionOutcome::Aborted,
                },
                opened = &mut open => match opened {
                    Ok(stream) => break stream,
                    Err(e) => return ConnectionOutcome::Transport(e),
                },
            }
        };

        self.report(ConnectionStatus::Connected);
        info!(
            "Connected to {} ({})",
            self.endpoint.base_url, self.endpoint.directory
        );

        let timeout = self.config.heartbeat_timeout;
        let deadline = sleep_until(Instant::now() + timeout);
        tokio::pin!(deadline);
        let mut decoder = SseDecoder::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ConnectionOutcome::Aborted,
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.apply(command) {
                            return ConnectionOutcome::Aborted;
                        }
                    }
                    None => return ConnectionOutcome::Aborted,
                },
                _ = &mut deadline => return ConnectionOutcome::HeartbeatTimeout,
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        for frame in decoder.feed(&bytes) {
                            deadline.as_mut().reset(Instant::now() + timeout);
                            // Only a stream that delivers clears the retry budget.
                            if self.failures > 0 {
                                self.failures = 0;
                                self.report(ConnectionStatus::Connected);
                            }
                            if let Some(event) = self.decode(&frame)
                                && self.events.send(event).await.is_err()
                            {
                                debug!("Event sink closed, stopping {}", self.endpoint.base_url);
                                cancel.cancel();
                                return ConnectionOutcome::Aborted;
                            }
                        }
                    }
                    Some(Err(e)) => return ConnectionOutcome::Transport(e),
                    None => return ConnectionOutcome::Ended,
                },
            }
        }
    }

    /// Decode one frame. Malformed frames are dropped.
    fn decode(&self, frame: &SseFrame) -> Option<TaggedEvent> {
        let raw = match GlobalEvent::from_frame(&frame.data, &self.endpoint.directory) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(
                    "Dropping undecodable frame from {}: {}",
                    self.endpoint.base_url, e
                );
                return None;
            }
        };
        let event = match raw.decode() {
            Ok(event) => event,
            Err(e) => {
                debug!(
                    "Dropping {} event from {}: {}",
                    raw.payload.kind, self.endpoint.base_url, e
                );
                return None;
            }
        };
        Some(TaggedEvent {
            server: self.endpoint.base_url.clone(),
            raw,
            event,
        })
    }
}
