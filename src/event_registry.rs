//! Mapping from event name to a typed dispatch callback.
//!
//! Registration happens once, typically before `Transport::connect`, though runtime
//! registration is also supported: the table is guarded by a `parking_lot::RwLock`, so
//! a registration made from another task becomes visible to the receive loop on its
//! next lookup without any extra handshake.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Type-erased handle to a registered event's decode-then-dispatch behavior.
trait EventHandler: Send + Sync {
    /// Decode `params` and invoke the dispatch callback. Returns `Err` with a detail
    /// string if decoding failed; the caller treats that the same as "not registered"
    /// (both surface as `unknown_message_received`).
    fn handle(&self, params: Value) -> std::result::Result<(), String>;
}

struct TypedEventHandler<T, F> {
    dispatch: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> EventHandler for TypedEventHandler<T, F>
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync,
{
    fn handle(&self, params: Value) -> std::result::Result<(), String> {
        let decoded: T = serde_json::from_value(params).map_err(|e| e.to_string())?;
        (self.dispatch)(decoded);
        Ok(())
    }
}

/// `event name -> dispatch callback` table.
#[derive(Default)]
pub struct EventRegistry {
    entries: RwLock<HashMap<String, Arc<dyn EventHandler>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dispatch` to run whenever an event named `name` arrives, decoding its
    /// `params` as `T`.
    ///
    /// Registering the same name twice is last-writer-wins: the previous dispatch is
    /// dropped and only the most recent one will ever be called.
    pub fn register<T, F>(&self, name: impl Into<String>, dispatch: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let handler = TypedEventHandler {
            dispatch,
            _marker: PhantomData,
        };
        self.entries
            .write()
            .insert(name.into(), Arc::new(handler) as Arc<dyn EventHandler>);
    }

    /// Decode and dispatch `params` for event `name`.
    ///
    /// Returns `true` if `name` was registered and decoding succeeded, `false`
    /// otherwise (no registration, or a decode failure). Either case is reported by
    /// the caller as an unknown message.
    pub fn dispatch(&self, name: &str, params: Value) -> bool {
        let handler = match self.entries.read().get(name).cloned() {
            Some(h) => h,
            None => return false,
        };
        match handler.handle(params) {
            Ok(()) => true,
            Err(detail) => {
                tracing::debug!(event = name, error = %detail, "event payload failed to decode");
                false
            }
        }
    }

    /// Remove every registration. Used at transport teardown.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    struct LoadEvent {
        context: String,
        url: String,
        timestamp: i64,
    }

    #[test]
    fn dispatch_invokes_registered_callback_exactly_once() {
        let registry = EventRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        registry.register::<LoadEvent, _>("browsingContext.load", move |event| {
            assert_eq!(event.context, "c1");
            assert_eq!(event.url, "https://a");
            assert_eq!(event.timestamp, 1700);
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        let dispatched = registry.dispatch(
            "browsingContext.load",
            serde_json::json!({"context": "c1", "url": "https://a", "timestamp": 1700}),
        );

        assert!(dispatched);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregistered_event_is_not_dispatched() {
        let registry = EventRegistry::new();
        assert!(!registry.dispatch("some.unregistered", serde_json::json!({})));
    }

    #[test]
    fn re_registering_a_name_is_last_writer_wins() {
        let registry = EventRegistry::new();
        let first_called = Arc::new(AtomicUsize::new(0));
        let second_called = Arc::new(AtomicUsize::new(0));

        {
            let first_called = Arc::clone(&first_called);
            registry.register::<LoadEvent, _>("browsingContext.load", move |_| {
                first_called.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let second_called = Arc::clone(&second_called);
            registry.register::<LoadEvent, _>("browsingContext.load", move |_| {
                second_called.fetch_add(1, Ordering::SeqCst);
            });
        }

        registry.dispatch(
            "browsingContext.load",
            serde_json::json!({"context": "c1", "url": "https://a", "timestamp": 1}),
        );

        assert_eq!(first_called.load(Ordering::SeqCst), 0);
        assert_eq!(second_called.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decode_failure_is_reported_as_not_dispatched() {
        let registry = EventRegistry::new();
        registry.register::<LoadEvent, _>("browsingContext.load", |_| {
            panic!("should not be called");
        });

        let dispatched = registry.dispatch("browsingContext.load", serde_json::json!({"context": "c1"}));
        assert!(!dispatched);
    }
}
