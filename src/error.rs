// Error types for the BiDi transport core

use thiserror::Error;

/// Result type alias for bidi-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error payload decoded from a peer error frame.
///
/// Mirrors the shape described in the wire protocol: `{ error, message, stacktrace }`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. "no such frame")
    pub error: String,
    /// Human-readable error message
    pub message: String,
    /// Optional peer-side stack trace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stacktrace: Option<String>,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

/// Errors surfaced by the transport, command registry and connection layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted while the transport was not in the `Connected` state
    #[error("not connected")]
    NotConnected,

    /// The monotonic id counter produced an id already present in the registry.
    ///
    /// This is an internal invariant violation. The counter discipline makes it
    /// unreachable in practice, and it is treated as fatal when it fires.
    #[error("duplicate command id: {0}")]
    DuplicateCommandId(u64),

    /// `wait_for_command` exceeded its deadline
    #[error("command {0} timed out")]
    CommandTimeout(u64),

    /// `take_command_response` called for an id never issued, or already taken
    #[error("unknown command id: {0}")]
    UnknownCommandId(u64),

    /// A pending command was aborted because the transport left `Connected`
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer returned a structured error for a command
    #[error("peer error: {0}")]
    PeerError(ErrorResponse),

    /// A successful response could not be decoded into the declared result type
    #[error("failed to decode response: {0}")]
    DecodeFailure(String),

    /// The WebSocket handshake did not complete
    #[error("failed to start transport: {0}")]
    TransportStartFailed(String),

    /// Sending or receiving a frame failed at the WebSocket layer
    #[error("transport error: {0}")]
    TransportError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
