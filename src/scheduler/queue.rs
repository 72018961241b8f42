//! Bounded-concurrency work queue.
//!
//! Thunks start in the order they were queued, at most `limit` at a time.
//! Each one settles into its own slot, so a failing or panicking thunk never
//! disturbs its siblings and [`BoundedRunner::settle`] returns results in
//! submission order regardless of completion order.

use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

/// Result of one settled thunk.
pub type Settled<T> = anyhow::Result<T>;

type Thunk<T> = std::pin::Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

struct Queued<T> {
    thunk: Thunk<T>,
    slot: oneshot::Sender<Settled<T>>,
}

/// Runs queued async thunks with a concurrency ceiling.
///
/// Thunks run on spawned tasks, which do not inherit task-locals from the
/// caller; wrap them in whatever scope they need before queueing.
pub struct BoundedRunner<T> {
    queue: mpsc::UnboundedSender<Queued<T>>,
    slots: Vec<oneshot::Receiver<Settled<T>>>,
    driver: JoinHandle<()>,
}

impl<T: Send + 'static> BoundedRunner<T> {
    /// `None` or `Some(0)` means unbounded.
    pub fn new(limit: Option<usize>) -> Self {
        let permits = limit.filter(|n| *n > 0).map(|n| Arc::new(Semaphore::new(n)));
        let (queue, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(rx, permits));

        Self {
            queue,
            slots: Vec::new(),
            driver,
        }
    }

    /// Queue a thunk; it starts as soon as a slot is free.
    pub fn run<F>(&mut self, thunk: F)
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (slot, settled) = oneshot::channel();
        let queued = Queued {
            thunk: Box::pin(thunk),
            slot,
        };
        if let Err(mpsc::error::SendError(queued)) = self.queue.send(queued) {
            // Driver is gone; settle the slot directly so positions stay aligned.
            let _ = queued.slot.send(Err(anyhow!("runner stopped before thunk was scheduled")));
        }
        self.slots.push(settled);
    }

    /// Number of thunks queued so far.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Wait for every queued thunk and return results by submission index.
    pub async fn settle(self) -> Vec<Settled<T>> {
        let Self {
            queue,
            slots,
            driver,
        } = self;
        drop(queue);

        let mut results = Vec::with_capacity(slots.len());
        for settled in slots {
            results.push(match settled.await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("thunk panicked or was aborted before settling")),
            });
        }

        if let Err(e) = driver.await {
            debug!(error = %e, "runner driver ended abnormally");
        }
        results
    }
}

async fn drive<T: Send + 'static>(
    mut rx: mpsc::UnboundedReceiver<Queued<T>>,
    permits: Option<Arc<Semaphore>>,
) {
    while let Some(Queued { thunk, slot }) = rx.recv().await {
        let permit = match &permits {
            Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    let _ = slot.send(Err(anyhow!("runner semaphore closed")));
                    continue;
                }
            },
            None => None,
        };

        tokio::spawn(async move {
            let result = thunk.await;
            drop(permit);
            let _ = slot.send(result);
        });
    }
}
