//! signal

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{error::ReactorError, reactor::ReactorHandle};

/// Identity of a subscription, returned by [`Signal::subscribe`] and
/// accepted by [`Signal::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber<T> {
    id: SubscriptionId,
    priority: i32,
    sequence: u64,
    callback: Box<dyn FnMut(&T) + Send>,
}

struct Inner<T> {
    subscribers: Vec<Subscriber<T>>,
    broadcasting: bool,
    finalized: bool,
    next_id: u64,
    next_sequence: u64,
}

/// A priority-ordered broadcast point. Subscribers are invoked highest
/// priority first, and in subscription order among equal priorities.
/// [`Signal::signal_final`] latches the signal closed: every subsequent
/// broadcast is silently dropped.
pub struct Signal<T: Clone + Send + 'static> {
    inner: Arc<Mutex<Inner<T>>>,
    reactor: ReactorHandle,
    restricted: bool,
}

impl<T: Clone + Send + 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            reactor: self.reactor.clone(),
            restricted: self.restricted,
        }
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    pub(crate) fn new(reactor: ReactorHandle) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                subscribers: Vec::new(),
                broadcasting: false,
                finalized: false,
                next_id: 0,
                next_sequence: 0,
            })),
            reactor,
            restricted: false,
        }
    }

    /// Returns a view that can subscribe/unsubscribe but cannot broadcast.
    pub fn restricted(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            reactor: self.reactor.clone(),
            restricted: true,
        }
    }

    pub fn subscribe(
        &self,
        priority: i32,
        callback: impl FnMut(&T) + Send + 'static,
    ) -> Result<SubscriptionId, ReactorError> {
        let mut guard = self.inner.lock();
        if guard.broadcasting {
            return Err(ReactorError::SignalContext);
        }
        let id = SubscriptionId(guard.next_id);
        guard.next_id += 1;
        let sequence = guard.next_sequence;
        guard.next_sequence += 1;
        guard.subscribers.push(Subscriber {
            id,
            priority,
            sequence,
            callback: Box::new(callback),
        });
        guard
            .subscribers
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ReactorError> {
        let mut guard = self.inner.lock();
        if guard.broadcasting {
            return Err(ReactorError::SignalContext);
        }
        guard.subscribers.retain(|s| s.id != id);
        Ok(())
    }

    /// Broadcasts a value to current subscribers. The broadcast is queued on
    /// the reactor and delivered on the reactor thread, in priority order.
    pub fn signal(&self, value: T) -> Result<(), ReactorError> {
        self.broadcast(value, false)
    }

    /// Broadcasts a final value, then latches the signal closed: every
    /// subsequent `signal`/`signal_final` call on this signal is a no-op.
    pub fn signal_final(&self, value: T) -> Result<(), ReactorError> {
        self.broadcast(value, true)
    }

    fn broadcast(&self, value: T, is_final: bool) -> Result<(), ReactorError> {
        if self.restricted {
            return Err(ReactorError::Restricted);
        }
        let inner = self.inner.clone();
        self.reactor
            .enqueue_signal(Box::new(move || Self::deliver(&inner, value, is_final)));
        Ok(())
    }

    /// Runs on the reactor thread when this broadcast is dequeued. Takes the
    /// subscriber list out of the lock before invoking callbacks, so a
    /// subscriber that tries to subscribe/unsubscribe reentrantly sees
    /// `broadcasting` still set (and errors) instead of deadlocking against
    /// the same mutex.
    fn deliver(inner: &Arc<Mutex<Inner<T>>>, value: T, is_final: bool) {
        let mut subscribers = {
            let mut guard = inner.lock();
            if guard.finalized {
                return;
            }
            guard.broadcasting = true;
            std::mem::take(&mut guard.subscribers)
        };
        for subscriber in subscribers.iter_mut() {
            (subscriber.callback)(&value);
        }
        let mut guard = inner.lock();
        guard.broadcasting = false;
        if is_final {
            guard.finalized = true;
        } else {
            guard.subscribers = subscribers;
        }
    }
}
