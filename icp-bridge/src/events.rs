//! Callback registries for out-of-band signals.
//!
//! The driver announces every rendered frame through [`Subscribers`] and the
//! host announces permanent unavailability through [`FatalLatch`]. Neither
//! side holds a reference to a particular window; anything interested
//! registers a callback and gets a [`SubscriptionId`] to remove it later.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A set of callbacks invoked with every published event.
pub struct Subscribers<E> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, Callback<E>)>>,
}

impl<E> Subscribers<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.reserve_id();
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    fn reserve_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Remove a callback. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(sub, _)| *sub != id);
        callbacks.len() != before
    }

    /// Invoke every registered callback.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe without deadlocking.
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Payload of the "bridge is permanently unavailable" event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unavailable {
    /// Consecutive failures that exhausted the budget.
    pub failures: u32,
    /// Last error seen before giving up.
    pub reason: String,
}

/// A one-shot event.
///
/// [`fire`](Self::fire) delivers the event at most once. Callbacks registered
/// after it fired are invoked immediately with the stored event.
#[derive(Debug, Default)]
pub struct FatalLatch {
    fired: AtomicBool,
    event: Mutex<Option<Unavailable>>,
    subscribers: Subscribers<Unavailable>,
}

impl FatalLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver the event. Returns `false` if the latch had already fired.
    pub fn fire(&self, event: Unavailable) -> bool {
        {
            let mut slot = self.event.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(event.clone());
            self.fired.store(true, Ordering::Release);
        }
        self.subscribers.notify(&event);
        true
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    pub fn event(&self) -> Option<Unavailable> {
        self.event.lock().clone()
    }

    pub fn subscribe(
        &self,
        callback: impl Fn(&Unavailable) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let slot = self.event.lock();
        match slot.clone() {
            Some(event) => {
                drop(slot);
                callback(&event);
                self.subscribers.reserve_id()
            }
            // Registering under the slot lock keeps a concurrent `fire` from
            // slipping in between the check and the registration.
            None => self.subscribers.subscribe(callback),
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }
}
