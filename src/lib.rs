//! Core protocol transport for a WebDriver BiDi client.
//!
//! This crate implements the request/response multiplexer and event-routing registry
//! that sit directly on top of a WebSocket connection to a BiDi-speaking browser: send
//! a named command with typed parameters, get back a correlated, typed result or
//! structured error; register typed handlers for unsolicited events.
//!
//! What this crate deliberately does not do: spawn or discover a browser driver
//! process (that's an external launcher; any WebSocket URL works), retry or
//! reconnect across transport failures, or provide typed facades for the hundreds of
//! concrete BiDi commands (`browsingContext.navigate`, `script.evaluate`, and so on).
//! Those are thin wrappers a caller builds on top of [`Transport::send_command`].
//!
//! The four pieces, from the bottom up:
//! - [`Connection`]: a duplex, framed WebSocket transport.
//! - [`command_registry::CommandRegistry`]: correlates command ids to their pending
//!   completion.
//! - [`event_registry::EventRegistry`]: dispatches decoded event payloads by name.
//! - [`Transport`]: owns all three; the type callers actually use.

pub mod command;
pub mod command_registry;
pub mod connection;
pub mod error;
pub mod event_registry;
pub mod subscribers;
pub mod transport;

pub use command::Command;
pub use command_registry::CommandId;
pub use connection::Connection;
pub use error::{Error, ErrorResponse, Result};
pub use transport::{Subscription, Transport};
