//! Wiring: supervisor -> fan-in -> batcher -> store.
//!
//! The engine owns the only [`DirectoryStore`] that is ever written to. It
//! lives inside the store batcher's sink; readers get snapshots through a
//! `watch` channel, published once per batch that changed something.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::batcher::{Batchable, BatchSender, Dispatch, EventBatcher};
use crate::config::EngineConfig;
use crate::error::{Result, SyncError};
use crate::store::{DirectoryStore, Hydration};
use crate::supervisor::{
    ConnectionSupervisor, Discovery, EventTransport, SupervisorHandle, SyncStatus, TaggedEvent,
    Visibility,
};

/// Capacity of the fan-in channel shared by all connections.
const EVENT_BUFFER_SIZE: usize = 1024;

/// Capacity of the raw event broadcast. Slow subscribers past this lag.
const RAW_BUFFER_SIZE: usize = 1024;

/// Input of the store writer.
#[derive(Debug)]
enum StoreInput {
    Event(TaggedEvent),
    Hydrate(Hydration),
}

impl Batchable for StoreInput {
    fn bypasses_batch(&self) -> bool {
        match self {
            Self::Event(event) => event.bypasses_batch(),
            Self::Hydrate(_) => true,
        }
    }

    /// Events queued before a bulk load are applied before it.
    fn is_barrier(&self) -> bool {
        matches!(self, Self::Hydrate(_))
    }
}

fn apply_input(store: &mut DirectoryStore, input: StoreInput) -> bool {
    match input {
        StoreInput::Event(tagged) => store.apply_decoded(tagged.directory(), &tagged.event),
        StoreInput::Hydrate(hydration) => {
            store.hydrate(hydration);
            true
        }
    }
}

/// A consumer's private batcher fed from the raw event feed.
pub struct Subscription {
    forward: JoinHandle<()>,
    batcher: EventBatcher<TaggedEvent>,
}

impl Subscription {
    /// Detach from the feed and flush what is queued.
    pub async fn unsubscribe(self) {
        self.forward.abort();
        let _ = self.forward.await;
        self.batcher.shutdown().await;
    }

    /// Wait until the engine shuts down and the last batch is delivered.
    pub async fn closed(self) {
        let _ = self.forward.await;
        self.batcher.shutdown().await;
    }
}

pub struct SyncEngine {
    supervisor: SupervisorHandle,
    raw: broadcast::Sender<TaggedEvent>,
    store: watch::Receiver<DirectoryStore>,
    writer: EventBatcher<StoreInput>,
    pump: JoinHandle<()>,
    batch_window: Duration,
}

impl SyncEngine {
    /// Start discovery, connections, and the store writer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: EngineConfig,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn EventTransport>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (raw, _) = broadcast::channel(RAW_BUFFER_SIZE);
        let (store_tx, store) = watch::channel(DirectoryStore::new());

        let mut current = DirectoryStore::new();
        let writer = EventBatcher::spawn(config.batch_window, move |dispatch: Dispatch<StoreInput>| {
            let mut changed = false;
            for input in dispatch.into_vec() {
                changed |= apply_input(&mut current, input);
            }
            if changed {
                store_tx.send_replace(current.clone());
            }
        });

        let supervisor =
            ConnectionSupervisor::new(config.supervisor, discovery, transport, events_tx).spawn();
        let pump = tokio::spawn(pump(events_rx, raw.clone(), writer.sender()));

        Self {
            supervisor,
            raw,
            store,
            writer,
            pump,
            batch_window: config.batch_window,
        }
    }

    /// Latest published state.
    pub fn snapshot(&self) -> DirectoryStore {
        self.store.borrow().clone()
    }

    /// Receiver that wakes on every published change.
    pub fn store(&self) -> watch::Receiver<DirectoryStore> {
        self.store.clone()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.supervisor.status()
    }

    /// Every decoded event from every server, unbatched.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<TaggedEvent> {
        self.raw.subscribe()
    }

    /// Feed raw events into a private batcher driving `sink`, using the
    /// engine's batch window.
    pub fn subscribe_batched<F>(&self, sink: F) -> Subscription
    where
        F: FnMut(Dispatch<TaggedEvent>) + Send + 'static,
    {
        self.subscribe_batched_with(self.batch_window, sink)
    }

    pub fn subscribe_batched_with<F>(&self, window: Duration, sink: F) -> Subscription
    where
        F: FnMut(Dispatch<TaggedEvent>) + Send + 'static,
    {
        let batcher = EventBatcher::spawn(window, sink);
        let forward = tokio::spawn(forward(self.raw.subscribe(), batcher.sender()));
        Subscription { forward, batcher }
    }

    /// Queue a bulk load for the store writer.
    pub fn hydrate(&self, hydration: Hydration) -> Result<()> {
        if self.writer.enqueue(StoreInput::Hydrate(hydration)) {
            Ok(())
        } else {
            Err(SyncError::Closed)
        }
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.supervisor.set_visibility(visibility);
    }

    pub fn rediscover(&self) {
        self.supervisor.rediscover();
    }

    /// Stop every connection, drain in-flight events into the store, and
    /// close the raw feed.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
        if let Err(e) = self.pump.await {
            warn!("Event pump ended abnormally: {}", e);
        }
        self.writer.shutdown().await;
        drop(self.raw);
    }
}

/// Fan-in loop: every event goes to raw subscribers and the store writer.
async fn pump(
    mut events: mpsc::Receiver<TaggedEvent>,
    raw: broadcast::Sender<TaggedEvent>,
    writer: BatchSender<StoreInput>,
) {
    while let Some(event) = events.recv().await {
        if raw.receiver_count() > 0 {
            let _ = raw.send(event.clone());
        }
        if !writer.enqueue(StoreInput::Event(event)) {
            break;
        }
    }
    debug!("Event pump stopped");
}

async fn forward(mut raw: broadcast::Receiver<TaggedEvent>, sender: BatchSender<TaggedEvent>) {
    loop {
        match raw.recv().await {
            Ok(event) => {
                if !sender.enqueue(event) {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Batched subscriber lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
