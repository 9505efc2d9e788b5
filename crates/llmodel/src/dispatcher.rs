//! Implements [`Dispatcher`], which runs closures sent from any thread on a single consumer.

use std::fmt;

use flume::{Receiver, Sender};
use tracing::trace;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// The consuming end of a dispatch queue.
///
/// Closures enqueued through any [`DispatchHandle`] run here, one at a time, in the order they
/// were enqueued. Drive it by calling [`Dispatcher::update`] from the loop of the thread that
/// must observe the events (a UI frame, a game tick), or hand it to an async task with
/// [`Dispatcher::run`].
pub struct Dispatcher {
    rx: Receiver<Job>,
    tx: Sender<Job>,
}

/// A cloneable handle for enqueueing closures onto a [`Dispatcher`].
#[derive(Clone)]
pub struct DispatchHandle {
    tx: Sender<Job>,
}

impl Dispatcher {
    /// Creates an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { rx, tx }
    }

    /// Returns a handle enqueueing onto this dispatcher.
    pub fn handle(&self) -> DispatchHandle {
        DispatchHandle {
            tx: self.tx.clone(),
        }
    }

    /// Runs the closures queued when the call starts, returning how many ran.
    ///
    /// Closures enqueued while this is running (including by the closures themselves) wait for
    /// the next call, so a single tick always ends.
    pub fn update(&mut self) -> usize {
        let queued = self.rx.len();
        let mut ran = 0;

        while ran < queued {
            let Ok(job) = self.rx.try_recv() else {
                break;
            };
            job();
            ran += 1;
        }

        if ran > 0 {
            trace!(ran, "Dispatched queued jobs");
        }

        ran
    }

    /// Returns the number of closures waiting to run.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Runs closures as they arrive, forever.
    ///
    /// The dispatcher keeps one sender of its own, so this only returns if the future is
    /// dropped.
    pub async fn run(self) {
        while let Ok(job) = self.rx.recv_async().await {
            job();
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending())
            .finish()
    }
}

impl DispatchHandle {
    /// Enqueues `job` to run on the dispatcher's consumer.
    ///
    /// Returns `false` if the dispatcher was dropped, in which case `job` is discarded.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }
}

impl fmt::Debug for DispatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchHandle").finish_non_exhaustive()
    }
}
