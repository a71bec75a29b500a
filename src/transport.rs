//! Protocol Transport: the piece that ties a [`Connection`] to a [`CommandRegistry`] and
//! an [`EventRegistry`], assigning ids, serializing outgoing commands, and classifying
//! and routing every inbound frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::command::Command;
use crate::command_registry::{CommandId, CommandRegistry, Outcome};
use crate::connection::Connection;
use crate::error::{Error, ErrorResponse, Result};
use crate::event_registry::EventRegistry;
use crate::subscribers::{SubscriptionId, Subscribers};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

/// Handle returned by `on_event`/`on_protocol_error`/`on_unknown_message`, identifying
/// both which broadcast list a callback was registered on and its id within that list
/// (the three lists each number their own subscriptions starting from 1, so the list
/// tag is required to route an `unsubscribe` call correctly).
#[derive(Debug, Clone, Copy)]
pub enum Subscription {
    Event(SubscriptionId),
    ProtocolError(SubscriptionId),
    UnknownMessage(SubscriptionId),
}

/// One parsed and classified inbound frame, per the wire protocol's four message
/// shapes (plus the catch-all for anything else).
enum InboundFrame {
    CommandResponse { id: CommandId, result: Value },
    CommandError { id: CommandId, error: ErrorResponse },
    UnsolicitedError { error: ErrorResponse },
    Event { method: String, params: Value },
    Unknown,
}

/// Pull `id` out of a frame as a `CommandId`, treating a missing or `null` id as "no
/// id" per the classification rules.
fn frame_id(frame: &Value) -> Option<CommandId> {
    frame
        .get("id")
        .and_then(Value::as_u64)
        .and_then(CommandId::new)
}

fn classify(frame: &Value) -> InboundFrame {
    let id = frame_id(frame);
    let has_result = frame.get("result").is_some();
    let has_error = frame.get("error").is_some();

    if has_error {
        let error = match serde_json::from_value::<ErrorResponse>(frame.clone()) {
            Ok(error) => error,
            Err(_) => return InboundFrame::Unknown,
        };
        return match id {
            Some(id) => InboundFrame::CommandError { id, error },
            None => InboundFrame::UnsolicitedError { error },
        };
    }

    if let (Some(id), true) = (id, has_result) {
        return InboundFrame::CommandResponse {
            id,
            result: frame["result"].clone(),
        };
    }

    if let Some(method) = frame.get("method").and_then(Value::as_str) {
        if let Some(params) = frame.get("params") {
            return InboundFrame::Event {
                method: method.to_string(),
                params: params.clone(),
            };
        }
    }

    InboundFrame::Unknown
}

/// Owns a [`Connection`], a [`CommandRegistry`] and an [`EventRegistry`]; the only type
/// callers interact with directly.
pub struct Transport {
    connection: Arc<Connection>,
    commands: Arc<CommandRegistry>,
    events: Arc<EventRegistry>,
    next_id: AtomicU64,
    state: Arc<Mutex<TransportState>>,
    command_timeout: Duration,
    on_event: Arc<Subscribers<(String, Value)>>,
    on_protocol_error: Arc<Subscribers<ErrorResponse>>,
    on_unknown_message: Arc<Subscribers<String>>,
}

impl Transport {
    /// Construct a new, disconnected transport. `command_timeout` applies to
    /// `send_command_and_wait`'s default wait; `None` uses a 30-second default.
    pub fn new(connection: Connection, command_timeout: Option<Duration>) -> Self {
        Self {
            connection: Arc::new(connection),
            commands: Arc::new(CommandRegistry::new()),
            events: Arc::new(EventRegistry::new()),
            next_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(TransportState::New)),
            command_timeout: command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            on_event: Arc::new(Subscribers::new()),
            on_protocol_error: Arc::new(Subscribers::new()),
            on_unknown_message: Arc::new(Subscribers::new()),
        }
    }

    /// Subscribe to every decoded event, regardless of whether a typed handler was
    /// registered for its name via [`Transport::register_event`].
    pub fn on_event(&self, callback: impl Fn(&(String, Value)) + Send + Sync + 'static) -> Subscription {
        Subscription::Event(self.on_event.subscribe(callback))
    }

    /// Subscribe to unsolicited peer errors (error frames with no `id`).
    pub fn on_protocol_error(&self, callback: impl Fn(&ErrorResponse) + Send + Sync + 'static) -> Subscription {
        Subscription::ProtocolError(self.on_protocol_error.subscribe(callback))
    }

    /// Subscribe to frames that could not be classified, or whose typed decode failed.
    pub fn on_unknown_message(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> Subscription {
        Subscription::UnknownMessage(self.on_unknown_message.subscribe(callback))
    }

    /// Remove a subscription previously returned by `on_event`, `on_protocol_error` or
    /// `on_unknown_message`. A no-op if it was already removed.
    pub fn unsubscribe(&self, subscription: Subscription) {
        match subscription {
            Subscription::Event(id) => self.on_event.unsubscribe(id),
            Subscription::ProtocolError(id) => self.on_protocol_error.unsubscribe(id),
            Subscription::UnknownMessage(id) => self.on_unknown_message.unsubscribe(id),
        }
    }

    /// Register a typed dispatch callback for event `name`. Last-writer-wins; see
    /// [`EventRegistry::register`]. Dispatch runs synchronously on the receive loop,
    /// so callbacks must not block.
    pub fn register_event<T, F>(&self, name: impl Into<String>, dispatch: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.events.register(name, dispatch);
    }

    /// Connect to `uri` and begin driving the receive loop on a spawned task.
    pub async fn connect(&self, uri: &str) -> Result<()> {
        *self.state.lock() = TransportState::Connecting;

        let mut frames = match self.connection.connect(uri).await {
            Ok(frames) => frames,
            Err(e) => {
                *self.state.lock() = TransportState::Closed;
                return Err(e);
            }
        };

        *self.state.lock() = TransportState::Connected;

        let connection = Arc::clone(&self.connection);
        let commands = Arc::clone(&self.commands);
        let events = Arc::clone(&self.events);
        let state = Arc::clone(&self.state);
        let on_event = Arc::clone(&self.on_event);
        let on_protocol_error = Arc::clone(&self.on_protocol_error);
        let on_unknown_message = Arc::clone(&self.on_unknown_message);

        tokio::spawn(async move {
            while let Some(raw) = frames.recv().await {
                Self::dispatch_frame(&commands, &events, &on_event, &on_protocol_error, &on_unknown_message, &raw);
            }
            tracing::debug!("connection closed, failing all pending commands");
            commands.fail_all_pending();
            events.clear();
            *state.lock() = TransportState::Closed;
            let _ = connection.disconnect().await;
        });

        Ok(())
    }

    fn dispatch_frame(
        commands: &CommandRegistry,
        events: &EventRegistry,
        on_event: &Subscribers<(String, Value)>,
        on_protocol_error: &Subscribers<ErrorResponse>,
        on_unknown_message: &Subscribers<String>,
        raw: &str,
    ) {
        let frame: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "frame failed to parse as JSON");
                on_unknown_message.notify(&raw.to_string());
                return;
            }
        };

        match classify(&frame) {
            InboundFrame::CommandResponse { id, result } => {
                if !commands.complete_result(id, result) {
                    tracing::debug!(id = id.get(), "response for unknown or already-taken command id");
                    on_unknown_message.notify(&raw.to_string());
                }
            }
            InboundFrame::CommandError { id, error } => {
                if !commands.complete_error(id, error) {
                    tracing::debug!(id = id.get(), "error for unknown or already-taken command id");
                    on_unknown_message.notify(&raw.to_string());
                }
            }
            InboundFrame::UnsolicitedError { error } => {
                tracing::warn!(error = %error, "unsolicited protocol error");
                on_protocol_error.notify(&error);
            }
            InboundFrame::Event { method, params } => {
                if events.dispatch(&method, params.clone()) {
                    on_event.notify(&(method, params));
                } else {
                    tracing::debug!(method = %method, "event not registered or failed to decode");
                    on_unknown_message.notify(&raw.to_string());
                }
            }
            InboundFrame::Unknown => {
                tracing::debug!("unclassifiable frame");
                on_unknown_message.notify(&raw.to_string());
            }
        }
    }

    /// Gracefully disconnect. Completes every pending command with
    /// [`Error::ConnectionClosed`] so no waiter deadlocks, and clears all registered
    /// event handlers.
    pub async fn disconnect(&self) -> Result<()> {
        *self.state.lock() = TransportState::Disconnecting;
        self.commands.fail_all_pending();
        self.connection.disconnect().await?;
        self.events.clear();
        *self.state.lock() = TransportState::Closed;
        Ok(())
    }

    /// Assign an id, register the pending entry, serialize, and write the command to
    /// the connection. Returns the assigned id.
    pub async fn send_command<T>(&self, command: Command<T>) -> Result<CommandId>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if *self.state.lock() != TransportState::Connected {
            return Err(Error::NotConnected);
        }

        let id = CommandId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
            .expect("counter starts at 1 and only increases");

        self.commands.insert::<T>(id)?;

        let frame = serde_json::json!({
            "id": id.get(),
            "method": command.method,
            "params": command.params,
        });

        if let Err(e) = self.connection.send(frame.to_string()).await {
            self.commands.remove(id);
            return Err(e);
        }

        tracing::trace!(id = id.get(), method = %command.method, "sent command");
        Ok(id)
    }

    /// Suspend until `id`'s outcome is set, or until `timeout` elapses.
    ///
    /// Leaves the registry entry in place; the caller retrieves the outcome separately
    /// with [`Transport::take_command_response`].
    pub async fn wait_for_command(&self, id: CommandId, timeout: Duration) -> Result<()> {
        let pending = self.commands.get(id).ok_or(Error::UnknownCommandId(id.get()))?;
        pending.wait(id, timeout).await
    }

    /// Remove and decode the response for `id`. Fails with
    /// [`Error::UnknownCommandId`] if `id` was never issued, or has already been taken.
    pub fn take_command_response<T>(&self, id: CommandId) -> Result<T>
    where
        T: 'static,
    {
        let pending = self.commands.remove(id).ok_or(Error::UnknownCommandId(id.get()))?;
        match pending.take_outcome().ok_or(Error::UnknownCommandId(id.get()))? {
            Outcome::Result(value) => {
                let boxed: Box<T> = value
                    .downcast::<T>()
                    .map_err(|_| Error::DecodeFailure("result type mismatch".to_string()))?;
                Ok(*boxed)
            }
            Outcome::Error(error) => Err(Error::PeerError(error)),
            Outcome::DecodeFailure(detail) => Err(Error::DecodeFailure(detail)),
            Outcome::ConnectionClosed => Err(Error::ConnectionClosed),
        }
    }

    /// `send_command` + `wait_for_command` (using the configured default timeout) +
    /// `take_command_response`, composed.
    pub async fn send_command_and_wait<T>(&self, command: Command<T>) -> Result<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let id = self.send_command(command).await?;
        self.wait_for_command(id, self.command_timeout).await?;
        self.take_command_response(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_command_response() {
        let frame = serde_json::json!({"id": 1, "result": {"ready": true}});
        match classify(&frame) {
            InboundFrame::CommandResponse { id, result } => {
                assert_eq!(id.get(), 1);
                assert_eq!(result, serde_json::json!({"ready": true}));
            }
            _ => panic!("expected CommandResponse"),
        }
    }

    #[test]
    fn error_takes_precedence_over_result() {
        let frame = serde_json::json!({
            "id": 2,
            "result": {"ready": true},
            "error": "no such frame",
            "message": "context x not found",
        });
        match classify(&frame) {
            InboundFrame::CommandError { id, error } => {
                assert_eq!(id.get(), 2);
                assert_eq!(error.error, "no such frame");
            }
            _ => panic!("expected CommandError"),
        }
    }

    #[test]
    fn null_id_on_error_is_unsolicited() {
        let frame = serde_json::json!({
            "id": null,
            "error": "invalid argument",
            "message": "bad frame",
        });
        assert!(matches!(classify(&frame), InboundFrame::UnsolicitedError { .. }));
    }

    #[test]
    fn missing_id_on_error_is_unsolicited() {
        let frame = serde_json::json!({"error": "invalid argument", "message": "bad frame"});
        assert!(matches!(classify(&frame), InboundFrame::UnsolicitedError { .. }));
    }

    #[test]
    fn method_and_params_classify_as_event() {
        let frame = serde_json::json!({
            "method": "browsingContext.load",
            "params": {"context": "c1", "url": "https://a", "timestamp": 1700},
        });
        match classify(&frame) {
            InboundFrame::Event { method, .. } => assert_eq!(method, "browsingContext.load"),
            _ => panic!("expected Event"),
        }
    }

    #[test]
    fn frame_with_nothing_recognizable_is_unknown() {
        let frame = serde_json::json!({"unexpected": true});
        assert!(matches!(classify(&frame), InboundFrame::Unknown));
    }

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Ready {
        ready: bool,
    }

    #[tokio::test]
    async fn send_command_before_connect_fails_not_connected() {
        let transport = Transport::new(Connection::new(), None);
        let cmd: Command<Ready> = Command::with_no_params("session.status");
        let err = transport.send_command(cmd).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[test]
    fn take_command_response_for_unknown_id_fails() {
        let transport = Transport::new(Connection::new(), None);
        let id = CommandId::new(99).unwrap();
        let err = transport.take_command_response::<Ready>(id).unwrap_err();
        assert!(matches!(err, Error::UnknownCommandId(99)));
    }
}
