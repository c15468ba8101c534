//! Async-event exclusion and delivery.
//!
//! The worker's progress thread owns every dispatch table. Other threads
//! never touch them: they post an [`AsyncEvent`] through an [`AsyncNotifier`],
//! and the progress thread applies it from `Worker::async_check_miss` while
//! holding the async block.

use crate::config::EpOp;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

/// An event raised outside the progress thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AsyncEvent {
    /// The peer with uuid `peer` has connected to our endpoint for `op`.
    RemoteConnected { peer: u64, op: EpOp },
}

/// Guard of the async block; async events are not applied while it is held
/// by another thread.
pub type AsyncGuard<'a> = ReentrantMutexGuard<'a, ()>;

/// Per-worker async context.
pub struct AsyncContext {
    lock: ReentrantMutex<()>,
    tx: Sender<AsyncEvent>,
    rx: Receiver<AsyncEvent>,
}

impl AsyncContext {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            lock: ReentrantMutex::new(()),
            tx,
            rx,
        }
    }

    /// Enters the async block. Reentrant on the same thread.
    pub fn block(&self) -> AsyncGuard<'_> {
        self.lock.lock()
    }

    /// A handle other threads use to post events.
    pub fn notifier(&self) -> AsyncNotifier {
        AsyncNotifier {
            tx: self.tx.clone(),
        }
    }

    /// True if events were posted and not yet applied.
    pub fn has_missed(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Takes every posted event, in posting order.
    pub(crate) fn take_missed(&self) -> Vec<AsyncEvent> {
        self.rx.try_iter().collect()
    }
}

impl Default for AsyncContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Posts async events to a worker. Cheap to clone and `Send`.
#[derive(Clone, Debug)]
pub struct AsyncNotifier {
    tx: Sender<AsyncEvent>,
}

impl AsyncNotifier {
    /// Posts `event`. Returns false if the worker is gone.
    pub fn post(&self, event: AsyncEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Reports that `peer` has connected to our endpoint for `op`.
    pub fn remote_connected(&self, peer: u64, op: EpOp) -> bool {
        self.post(AsyncEvent::RemoteConnected { peer, op })
    }
}
