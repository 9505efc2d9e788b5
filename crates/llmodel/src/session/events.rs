//! Fan-out of [`ModelEvent`]s to the subscribers of a session.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::executor::block_on;
use futures::Stream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::ModelEvent;

type Handler = Box<dyn FnMut(&ModelEvent) + Send>;

/// Identifies a handler registered with [`crate::SessionManager::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// The subscribers of a session. Cloning shares the list.
#[derive(Clone, Default)]
pub(crate) struct Subscribers {
    next_id: Arc<AtomicU64>,
    handlers: Arc<Mutex<Vec<(Subscription, Handler)>>>,
    streams: Arc<Mutex<Vec<UnboundedSender<ModelEvent>>>>,
}

impl Subscribers {
    pub(crate) fn add(&self, handler: impl FnMut(&ModelEvent) + Send + 'static) -> Subscription {
        let id = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Box::new(handler)));
        id
    }

    /// Removes the handler registered as `id`, returning `false` if it was already gone.
    pub(crate) fn remove(&self, id: Subscription) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(registered, _)| *registered != id);
        handlers.len() != before
    }

    pub(crate) fn stream(&self) -> EventStream {
        let (tx, rx) = unbounded_channel();
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        EventStream { rx }
    }

    /// Hands `event` to every handler in subscription order, then to every live stream.
    pub(crate) fn publish(&self, event: ModelEvent) {
        for handler in self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
        {
            handler.1(&event);
        }

        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// A stream of the events of a session, in the order they were published.
///
/// Events are delivered by the session's [`crate::Dispatcher`], so nothing arrives unless that
/// dispatcher is driven. The stream never ends while the session is alive.
pub struct EventStream {
    rx: UnboundedReceiver<ModelEvent>,
}

impl EventStream {
    /// Blocks the current thread, resolving to the next event, or `None` once the session is
    /// gone.
    pub fn next_event(&mut self) -> Option<ModelEvent> {
        block_on(self.rx.recv())
    }

    /// Asynchronously yields the current thread, resolving to the next event, or `None` once
    /// the session is gone.
    pub async fn next_event_async(&mut self) -> Option<ModelEvent> {
        self.rx.recv().await
    }

    /// Returns the next event if one is already waiting.
    pub fn try_next(&mut self) -> Option<ModelEvent> {
        self.rx.try_recv().ok()
    }
}

impl Iterator for EventStream {
    type Item = ModelEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}

impl Stream for EventStream {
    type Item = ModelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
