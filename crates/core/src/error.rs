//! Codec error model.

use thiserror::Error;

/// Result type used by the event codec.
pub type CodecResult<T> = Result<T, CodecError>;

/// Failure while moving an event or its payload to/from bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The payload value could not be serialized.
    #[error("failed to encode event data: {0}")]
    Encode(String),

    /// The payload bytes did not match the requested shape.
    #[error("failed to decode event data: {0}")]
    Decode(String),

    /// The wire bytes were not a valid event.
    #[error("malformed event on the wire: {0}")]
    Wire(String),

    /// The event has an empty name (it could never be routed).
    #[error("event name must not be empty")]
    EmptyName,
}

impl CodecError {
    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn wire(msg: impl Into<String>) -> Self {
        Self::Wire(msg.into())
    }
}
