//! In-memory table of in-flight commands, keyed by monotonically increasing id.
//!
//! The registry is the single place that knows how to turn a raw `serde_json::Value`
//! response into the caller's declared result type. Each entry is given a type-erased
//! decoder at insertion time (captured from the generic `T` the caller asked for in
//! [`crate::transport::Transport::send_command`]); the decoder is invoked exactly once,
//! by the receive loop, when a response for that id arrives.

use std::any::Any;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{Error, ErrorResponse, Result};

/// Id of an in-flight command. Never zero. Id 0 is reserved and never assigned.
pub type CommandId = NonZeroU64;

type Decoder = Box<dyn FnOnce(Value) -> std::result::Result<Box<dyn Any + Send>, String> + Send>;

/// The terminal state of a [`PendingCommand`], set exactly once by the receive loop.
pub enum Outcome {
    /// The peer responded with a `result` that decoded successfully into the caller's
    /// declared type. Boxed and type-erased; downcast with the same `T` the command
    /// was sent with.
    Result(Box<dyn Any + Send>),
    /// The peer responded with a structured error.
    Error(ErrorResponse),
    /// The peer's `result` could not be decoded into the caller's declared type.
    DecodeFailure(String),
    /// The transport left `Connected` before a response arrived.
    ConnectionClosed,
}

struct PendingState {
    decode: Option<Decoder>,
    outcome: Option<Outcome>,
}

/// One in-flight command awaiting its response.
///
/// `outcome` is `None` until `notify` fires; after that it is set exactly once and
/// never mutated again. The receive loop is the sole writer, callers are the sole
/// readers, and the handoff is the `Notify` wakeup.
pub struct PendingCommand {
    notify: Notify,
    state: Mutex<PendingState>,
}

impl PendingCommand {
    fn new(decode: Decoder) -> Self {
        Self {
            notify: Notify::new(),
            state: Mutex::new(PendingState {
                decode: Some(decode),
                outcome: None,
            }),
        }
    }

    /// Suspend until the outcome is set, or until `timeout` elapses.
    ///
    /// `id` is only used to attribute a timeout error to the right command.
    pub async fn wait(&self, id: CommandId, timeout: std::time::Duration) -> Result<()> {
        // Register interest before checking the outcome so a completion that races
        // with this call can't be signaled into the void between the check and the
        // await (`Notify::notify_waiters` does not buffer for later waiters).
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.state.lock().outcome.is_some() {
            return Ok(());
        }

        tokio::time::timeout(timeout, notified)
            .await
            .map_err(|_| Error::CommandTimeout(id.get()))?;
        Ok(())
    }

    /// Take the outcome, if one has been set. Does not block.
    pub fn take_outcome(&self) -> Option<Outcome> {
        self.state.lock().outcome.take()
    }

    fn complete(&self, outcome: Outcome) {
        let mut state = self.state.lock();
        if state.outcome.is_some() {
            // Completion is set exactly once; a second completion attempt is ignored.
            return;
        }
        state.outcome = Some(outcome);
        drop(state);
        self.notify.notify_waiters();
    }
}

/// Thread-safe `CommandId -> PendingCommand` table.
#[derive(Default)]
pub struct CommandRegistry {
    entries: Mutex<HashMap<CommandId, Arc<PendingCommand>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new entry for `id`, capturing a decoder specialized to `T`.
    ///
    /// Fails with [`Error::DuplicateCommandId`] if `id` is already present. Under the
    /// monotonic-counter discipline in `Transport` this cannot happen in practice; the
    /// check exists to turn a broken invariant into a loud, attributable error instead
    /// of silent data corruption.
    pub fn insert<T>(&self, id: CommandId) -> Result<Arc<PendingCommand>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let decode: Decoder = Box::new(|value: Value| {
            serde_json::from_value::<T>(value)
                .map(|v| Box::new(v) as Box<dyn Any + Send>)
                .map_err(|e| e.to_string())
        });
        let pending = Arc::new(PendingCommand::new(decode));

        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(Error::DuplicateCommandId(id.get()));
        }
        entries.insert(id, Arc::clone(&pending));
        Ok(pending)
    }

    /// Decode `result` using the entry's decoder and complete it with the outcome.
    /// A missing `id` is not an error here. The caller (the dispatch algorithm in
    /// `Transport`) treats that as an `Unknown` frame.
    pub fn complete_result(&self, id: CommandId, result: Value) -> bool {
        let pending = match self.entries.lock().get(&id).cloned() {
            Some(p) => p,
            None => return false,
        };
        let decode = pending.state.lock().decode.take();
        let outcome = match decode {
            Some(decode) => match decode(result) {
                Ok(value) => Outcome::Result(value),
                Err(detail) => Outcome::DecodeFailure(detail),
            },
            None => Outcome::DecodeFailure("response decoded more than once".to_string()),
        };
        pending.complete(outcome);
        true
    }

    /// Complete `id` with a peer-originated structured error.
    pub fn complete_error(&self, id: CommandId, error: ErrorResponse) -> bool {
        match self.entries.lock().get(&id).cloned() {
            Some(pending) => {
                pending.complete(Outcome::Error(error));
                true
            }
            None => false,
        }
    }

    /// Complete every still-pending entry with `ConnectionClosed`.
    ///
    /// Leaves entries in the table; removal is still the caller's job via
    /// `take_command_response`, matching the insert-by-sender/remove-by-caller
    /// invariant. Used when the transport leaves `Connected`, so no waiter deadlocks
    /// and a later `take_command_response` can still observe the `ConnectionClosed`
    /// outcome instead of an `UnknownCommandId`.
    pub fn fail_all_pending(&self) {
        for pending in self.entries.lock().values() {
            pending.complete(Outcome::ConnectionClosed);
        }
    }

    /// Look up the entry for `id` without removing it. Used by `wait_for_command`,
    /// which must leave the entry in place for a later `take_command_response`.
    pub fn get(&self, id: CommandId) -> Option<Arc<PendingCommand>> {
        self.entries.lock().get(&id).cloned()
    }

    /// Remove and return the entry for `id`, if present.
    pub fn remove(&self, id: CommandId) -> Option<Arc<PendingCommand>> {
        self.entries.lock().remove(&id)
    }

    /// Number of entries currently tracked. Exposed for tests asserting the registry
    /// drains after a round trip.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Ready {
        ready: bool,
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let registry = CommandRegistry::new();
        let id = CommandId::new(1).unwrap();
        registry.insert::<Ready>(id).unwrap();
        let err = registry.insert::<Ready>(id).unwrap_err();
        assert!(matches!(err, Error::DuplicateCommandId(1)));
    }

    #[tokio::test]
    async fn complete_result_decodes_and_wakes_waiter() {
        let registry = CommandRegistry::new();
        let id = CommandId::new(1).unwrap();
        let pending = registry.insert::<Ready>(id).unwrap();

        assert!(registry.complete_result(id, serde_json::json!({"ready": true})));
        pending.wait(id, std::time::Duration::from_secs(1)).await.unwrap();

        match pending.take_outcome().unwrap() {
            Outcome::Result(value) => {
                let ready = value.downcast::<Ready>().unwrap();
                assert_eq!(*ready, Ready { ready: true });
            }
            _ => panic!("expected Result outcome"),
        }
    }

    #[test]
    fn complete_result_for_unknown_id_is_reported_as_absent() {
        let registry = CommandRegistry::new();
        let id = CommandId::new(7).unwrap();
        assert!(!registry.complete_result(id, serde_json::json!({})));
    }

    #[tokio::test]
    async fn fail_all_pending_wakes_every_waiter() {
        let registry = CommandRegistry::new();
        let id_a = CommandId::new(1).unwrap();
        let id_b = CommandId::new(2).unwrap();
        let a = registry.insert::<Ready>(id_a).unwrap();
        let b = registry.insert::<Ready>(id_b).unwrap();

        registry.fail_all_pending();

        a.wait(id_a, std::time::Duration::from_secs(1)).await.unwrap();
        b.wait(id_b, std::time::Duration::from_secs(1)).await.unwrap();
        assert!(matches!(a.take_outcome().unwrap(), Outcome::ConnectionClosed));
        assert!(matches!(b.take_outcome().unwrap(), Outcome::ConnectionClosed));

        // entries stay in the table until the caller removes them
        assert_eq!(registry.len(), 2);
        registry.remove(id_a);
        registry.remove(id_b);
        assert!(registry.is_empty());
    }

    #[test]
    fn complete_is_idempotent() {
        let registry = CommandRegistry::new();
        let id = CommandId::new(1).unwrap();
        let pending = registry.insert::<Ready>(id).unwrap();
        pending.complete(Outcome::ConnectionClosed);
        pending.complete(Outcome::ConnectionClosed);
        assert!(matches!(pending.take_outcome().unwrap(), Outcome::ConnectionClosed));
        assert!(pending.take_outcome().is_none());
    }
}
