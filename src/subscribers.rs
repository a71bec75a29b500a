//! Small multi-subscriber broadcast helper.
//!
//! Backs the Transport's `event_received`, `protocol_error_received` and
//! `unknown_message_received` observable outputs (§4.5): any number of callbacks can
//! subscribe, subscribe/unsubscribe is thread-safe with respect to dispatch, and
//! dispatch never invokes a callback that was removed before the dispatch snapshot was
//! taken.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Handle returned by [`Subscribers::subscribe`]; pass to [`Subscribers::unsubscribe`]
/// to remove the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct Subscribers<T> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(SubscriptionId, Arc<dyn Fn(&T) + Send + Sync>)>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Never blocks; safe to call from within a dispatch.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a previously registered callback. A no-op if it was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.callbacks.lock().retain(|(existing, _)| *existing != id);
    }

    /// Invoke every currently registered callback with `value`.
    ///
    /// Takes a snapshot under the lock and releases it before calling out, so a
    /// callback that subscribes or unsubscribes doesn't deadlock against itself.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<_> = self.callbacks.lock().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in snapshot {
            callback(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn notify_calls_every_subscriber() {
        let subscribers: Subscribers<i32> = Subscribers::new();
        let sum = Arc::new(AtomicUsize::new(0));

        let sum_a = Arc::clone(&sum);
        subscribers.subscribe(move |v| {
            sum_a.fetch_add(*v as usize, Ordering::SeqCst);
        });
        let sum_b = Arc::clone(&sum);
        subscribers.subscribe(move |v| {
            sum_b.fetch_add(*v as usize, Ordering::SeqCst);
        });

        subscribers.notify(&5);
        assert_eq!(sum.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn unsubscribed_callback_is_never_invoked_again() {
        let subscribers: Subscribers<i32> = Subscribers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let id = subscribers.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        subscribers.notify(&1);
        subscribers.unsubscribe(id);
        subscribers.notify(&1);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
