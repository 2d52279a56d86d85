//! In-process subject/subscriber primitive.
//!
//! Used by events to publish occurrences, by devices to publish state
//! changes, and by connections to publish closure. Subscribers are keyed by
//! the token returned from [`Publisher::subscribe`]; the publisher takes no
//! ownership of subscriber lifetimes beyond the stored closure.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Token identifying one subscription; pass it back to
/// [`Publisher::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Allows objects to subscribe for notification about data.
///
/// Subscription registers a closure to be called with each payload.
/// Notification iterates a snapshot taken under a short lock, so
/// subscribers may subscribe/unsubscribe from within their callback.
pub struct Publisher<T> {
    inner: Mutex<Registry<T>>,
}

struct Registry<T> {
    next_id: u64,
    subscribers: HashMap<u64, Subscriber<T>>,
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Publisher<T> {
    /// Create a publisher with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry {
                next_id: 0,
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Subscribe for notifications. O(1).
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut registry = self.inner.lock().expect("publisher lock");
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, Arc::new(subscriber));
        Subscription(id)
    }

    /// Unsubscribe. O(1), idempotent; returns whether the token was live.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut registry = self.inner.lock().expect("publisher lock");
        registry.subscribers.remove(&subscription.0).is_some()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("publisher lock").subscribers.len()
    }

    /// Notify all subscribers with the payload.
    ///
    /// The subscriber set is snapshotted under the lock, then callbacks run
    /// outside it. A panicking subscriber is logged and swallowed so it
    /// cannot block the others.
    pub fn notify_subscribers(&self, payload: &T) {
        let snapshot: Vec<Subscriber<T>> = {
            let registry = self.inner.lock().expect("publisher lock");
            registry.subscribers.values().cloned().collect()
        };

        for subscriber in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| subscriber(payload))) {
                let what = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".into());
                warn!(%what, "Subscriber panicked during notification");
            }
        }
    }
}

impl<T> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn notifies_every_subscriber() {
        let publisher = Publisher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            publisher.subscribe(move |n: &usize| {
                hits.fetch_add(*n, Ordering::SeqCst);
            });
        }

        publisher.notify_subscribers(&2);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn unsubscribed_no_longer_notified() {
        let publisher = Publisher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let token = publisher.subscribe(move |_: &()| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        publisher.notify_subscribers(&());
        assert!(publisher.unsubscribe(token));
        // Second unsubscribe is a no-op.
        assert!(!publisher.unsubscribe(token));
        publisher.notify_subscribers(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_does_not_block_others() {
        let publisher = Publisher::new();
        let hits = Arc::new(AtomicUsize::new(0));

        publisher.subscribe(|_: &()| panic!("bad subscriber"));
        let hits_clone = Arc::clone(&hits);
        publisher.subscribe(move |_: &()| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        publisher.notify_subscribers(&());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
