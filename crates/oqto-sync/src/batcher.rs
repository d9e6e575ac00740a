//! Frame-sized event coalescing.
//!
//! Each subscriber gets its own [`EventBatcher`]: a task that collects events
//! into a FIFO queue and hands the whole queue to its sink once the batch
//! window elapses. The window starts with the first event that lands in an
//! empty queue. Control events skip the queue and reach the sink right away.
//! Barrier items also skip it, but only after flushing what is already queued.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use oqto_sync_protocol::SyncEvent;

/// Default batch window, roughly one display frame.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(16);

/// Items that may need to skip batching.
pub trait Batchable {
    /// Dispatch immediately instead of waiting for the window.
    fn bypasses_batch(&self) -> bool;

    /// Flush the queue before an immediate dispatch, keeping arrival order.
    /// Only consulted for items that bypass the batch.
    fn is_barrier(&self) -> bool {
        false
    }
}

impl Batchable for SyncEvent {
    fn bypasses_batch(&self) -> bool {
        self.is_control()
    }
}

/// What a sink receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch<T> {
    /// A single control item, delivered as soon as it was enqueued.
    Immediate(T),
    /// Everything queued during one window, in arrival order.
    Batch(Vec<T>),
}

impl<T> Dispatch<T> {
    pub fn len(&self) -> usize {
        match self {
            Self::Immediate(_) => 1,
            Self::Batch(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::Immediate(item) => vec![item],
            Self::Batch(items) => items,
        }
    }
}

/// Cloneable producer side of an [`EventBatcher`].
pub struct BatchSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for BatchSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> BatchSender<T> {
    /// Queue an item. Returns `false` once the batcher has stopped.
    pub fn enqueue(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

pub struct EventBatcher<T> {
    sender: BatchSender<T>,
    task: JoinHandle<()>,
}

impl<T> EventBatcher<T>
where
    T: Batchable + Send + 'static,
{
    /// Start a batcher that feeds `sink`.
    ///
    /// The sink runs on the batcher task, one dispatch at a time, so it may
    /// own mutable state.
    pub fn spawn<F>(window: Duration, sink: F) -> Self
    where
        F: FnMut(Dispatch<T>) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, window, sink));
        Self {
            sender: BatchSender { tx },
            task,
        }
    }

    pub fn enqueue(&self, item: T) -> bool {
        self.sender.enqueue(item)
    }

    pub fn sender(&self) -> BatchSender<T> {
        self.sender.clone()
    }

    /// Stop accepting items, flush what is queued, and wait for the sink.
    ///
    /// Resolves once every [`BatchSender`] handed out has been dropped too.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.task.await {
            debug!("Batcher task ended abnormally: {}", e);
        }
    }
}

async fn run<T, F>(mut rx: mpsc::UnboundedReceiver<T>, window: Duration, mut sink: F)
where
    T: Batchable,
    F: FnMut(Dispatch<T>),
{
    let mut queue: Vec<T> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                sink(Dispatch::Batch(std::mem::take(&mut queue)));
            }

            item = rx.recv() => match item {
                Some(item) if item.bypasses_batch() => {
                    if item.is_barrier() && !queue.is_empty() {
                        deadline = None;
                        sink(Dispatch::Batch(std::mem::take(&mut queue)));
                    }
                    sink(Dispatch::Immediate(item));
                }
                Some(item) => {
                    if queue.is_empty() {
                        deadline = Some(Instant::now() + window);
                    }
                    queue.push(item);
                }
                None => {
                    if !queue.is_empty() {
                        sink(Dispatch::Batch(std::mem::take(&mut queue)));
                    }
                    break;
                }
            },
        }
    }
}
