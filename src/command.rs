//! The outgoing half of the data model: a method name plus parameters, carrying the
//! type its response should decode into.

use std::marker::PhantomData;

use serde::Serialize;

/// A command to send to the peer, parameterized by its expected result type.
///
/// `T` never appears in the serialized form. It exists purely so the Transport can
/// capture a decoder specialized to it at `send_command` time. This is the
/// compile-time-checked stand-in for a runtime "result schema descriptor".
pub struct Command<T> {
    pub method: String,
    pub params: serde_json::Value,
    _result: PhantomData<fn() -> T>,
}

impl<T> Command<T> {
    /// Build a command from a method name and any `Serialize` params value.
    pub fn new(method: impl Into<String>, params: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            method: method.into(),
            params: serde_json::to_value(params)?,
            _result: PhantomData,
        })
    }

    /// Build a command with no parameters, sent as an empty JSON object.
    pub fn with_no_params(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: serde_json::Value::Object(Default::default()),
            _result: PhantomData,
        }
    }
}
