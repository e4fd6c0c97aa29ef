//! Typed publish/subscribe channel.
//!
//! Listeners are invoked synchronously, in registration order, every time a
//! value is published. Each `subscribe` returns a [`Subscription`] token that
//! removes exactly that listener, either through
//! [`Subscription::unsubscribe`] or when the token is dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Listeners<T> {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, Listener<T>>>,
}

impl<T> Listeners<T> {
    fn remove(&self, id: u64) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&id);
    }
}

/// Multi-listener event channel for values of type `T`.
///
/// Clones share the same listener set.
pub struct EventBus<T> {
    listeners: Arc<Listeners<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
        }
    }
}

impl<T: 'static> EventBus<T> {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Listeners {
                next_id: AtomicU64::new(0),
                entries: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Register a listener.
    ///
    /// The listener stays registered for as long as the returned token lives.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.listeners.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(listener));

        let weak: Weak<Listeners<T>> = Arc::downgrade(&self.listeners);
        Subscription {
            id,
            cancel: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    listeners.remove(id);
                }
            })),
        }
    }

    /// Deliver `event` to every registered listener.
    ///
    /// Listeners run outside the registry lock, so a listener may subscribe or
    /// unsubscribe while being notified. Returns the number of listeners called.
    pub fn publish(&self, event: &T) -> usize {
        let snapshot: Vec<Listener<T>> = {
            let entries = self
                .listeners
                .entries
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            entries.values().cloned().collect()
        };

        for listener in &snapshot {
            listener(event);
        }
        snapshot.len()
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<T: 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for EventBus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .listeners
            .entries
            .lock()
            .map(|e| e.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("listeners", &count).finish()
    }
}

/// Handle to a registered listener.
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the listener.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    /// Keep the listener registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.cancel = None;
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fan_out_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = seen.clone();
        let _a = bus.subscribe(move |v| s1.lock().unwrap().push(("a", *v)));
        let s2 = seen.clone();
        let _b = bus.subscribe(move |v| s2.lock().unwrap().push(("b", *v)));

        assert_eq!(bus.publish(&7), 2);
        assert_eq!(*seen.lock().unwrap(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn test_unsubscribe_only_removes_one() {
        let bus: EventBus<()> = EventBus::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = first.clone();
        let sub_first = bus.subscribe(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = second.clone();
        let _sub_second = bus.subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        sub_first.unsubscribe();
        bus.publish(&());

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_drop_unsubscribes_and_detach_keeps() {
        let bus: EventBus<()> = EventBus::new();
        {
            let _sub = bus.subscribe(|_| {});
            assert_eq!(bus.listener_count(), 1);
        }
        assert_eq!(bus.listener_count(), 0);

        bus.subscribe(|_| {}).detach();
        assert_eq!(bus.listener_count(), 1);
    }

    #[test]
    fn test_subscription_outlives_bus() {
        let bus: EventBus<()> = EventBus::new();
        let sub = bus.subscribe(|_| {});
        drop(bus);
        sub.unsubscribe();
    }
}
